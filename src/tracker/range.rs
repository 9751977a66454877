//! Bitset-backed acknowledgment accounting for one message-ID range.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

const BITS_PER_WORD: u64 = 64;

/// Outcome of acking a single message ID against a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ID lies outside `[start_id, start_id + range_len)`; no state change.
    OutOfRange,
    /// First ack for this ID.
    Fresh,
    /// The ID was already acked at least once.
    Duplicate,
}

/// Rejected truncation: the new length would drop an acked message.
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "cannot shrink range starting at {start_id} from {range_len} to {new_len}: \
     acked messages above the new length"
)]
pub struct RangeShrinkViolation {
    /// First message ID of the range.
    pub start_id: u64,
    /// Length before the attempted truncation.
    pub range_len: u64,
    /// The rejected new length.
    pub new_len: u64,
}

#[derive(Debug)]
struct RangeState {
    range_len: u64,
    timestamp: Option<DateTime<Utc>>,
    acked_count: u64,
    duplicate_count: u64,
    // One bit per message, little-endian within each word.
    bitmap: Vec<u64>,
}

/// A half-open range `[start_id, start_id + range_len)` of message IDs with
/// a bitmap recording which have been acknowledged.
///
/// Readers (`is_acked`, the counters, `older_than`) take the shared lock;
/// writers (`ack`, `set_range_len`, `set_timestamp`) take the exclusive one.
#[derive(Debug)]
pub struct MessageRange {
    start_id: u64,
    inner: RwLock<RangeState>,
}

impl MessageRange {
    /// Create a range with no timestamp (the "unknown" sentinel used when a
    /// range is created lazily from an ack before its announcement arrives).
    ///
    /// # Panics
    ///
    /// Panics if `range_len` is zero.
    pub fn new(start_id: u64, range_len: u64) -> Self {
        Self::build(start_id, range_len, None)
    }

    /// Create a range carrying the generator-side creation timestamp.
    pub fn with_timestamp(start_id: u64, range_len: u64, timestamp: DateTime<Utc>) -> Self {
        Self::build(start_id, range_len, Some(timestamp))
    }

    fn build(start_id: u64, range_len: u64, timestamp: Option<DateTime<Utc>>) -> Self {
        assert!(range_len > 0, "range length must be > 0");

        let words = range_len.div_ceil(BITS_PER_WORD) as usize;
        Self {
            start_id,
            inner: RwLock::new(RangeState {
                range_len,
                timestamp,
                acked_count: 0,
                duplicate_count: 0,
                bitmap: vec![0; words],
            }),
        }
    }

    /// First message ID of the range.
    pub fn start_id(&self) -> u64 {
        self.start_id
    }

    /// Current (possibly truncated) length of the range.
    pub fn range_len(&self) -> u64 {
        self.inner.read().range_len
    }

    /// Mark a message ID as acknowledged.
    pub fn ack(&self, msg_id: u64) -> AckOutcome {
        let mut state = self.inner.write();

        if !contains(self.start_id, state.range_len, msg_id) {
            return AckOutcome::OutOfRange;
        }

        let offset = msg_id - self.start_id;
        let word = (offset / BITS_PER_WORD) as usize;
        let bit = offset % BITS_PER_WORD;
        let mask = 1u64 << bit;

        if state.bitmap[word] & mask != 0 {
            state.duplicate_count += 1;
            AckOutcome::Duplicate
        } else {
            state.bitmap[word] |= mask;
            state.acked_count += 1;
            AckOutcome::Fresh
        }
    }

    /// Whether a message ID has been acknowledged at least once.
    pub fn is_acked(&self, msg_id: u64) -> bool {
        let state = self.inner.read();

        if !contains(self.start_id, state.range_len, msg_id) {
            return false;
        }

        let offset = msg_id - self.start_id;
        let word = (offset / BITS_PER_WORD) as usize;
        let bit = offset % BITS_PER_WORD;
        state.bitmap[word] & (1 << bit) != 0
    }

    /// Number of unique messages acknowledged so far.
    pub fn acked_count(&self) -> u64 {
        self.inner.read().acked_count
    }

    /// Number of second-and-subsequent acks observed.
    pub fn duplicate_count(&self) -> u64 {
        self.inner.read().duplicate_count
    }

    /// Number of messages never acknowledged.
    pub fn unacked_count(&self) -> u64 {
        let state = self.inner.read();
        state.range_len - state.acked_count
    }

    /// Generator-side creation timestamp, if announced.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.read().timestamp
    }

    /// Install or refresh the announced timestamp.
    pub fn set_timestamp(&self, timestamp: DateTime<Utc>) {
        self.inner.write().timestamp = Some(timestamp);
    }

    /// Whether the range was announced before `cutoff`. Ranges with no
    /// announcement yet are never considered old.
    pub fn older_than(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(self.inner.read().timestamp, Some(ts) if ts < cutoff)
    }

    /// Truncate the range to `new_len` messages.
    ///
    /// Truncation only: growing is rejected, as is any shrink that would
    /// drop an already-acked message. The bitmap keeps its original size.
    pub fn set_range_len(&self, new_len: u64) -> Result<(), RangeShrinkViolation> {
        let mut state = self.inner.write();

        let violation = || RangeShrinkViolation {
            start_id: self.start_id,
            range_len: state.range_len,
            new_len,
        };

        if new_len > state.range_len {
            return Err(violation());
        }

        for offset in new_len..state.range_len {
            let word = (offset / BITS_PER_WORD) as usize;
            let bit = offset % BITS_PER_WORD;
            if state.bitmap[word] & (1 << bit) != 0 {
                return Err(violation());
            }
        }

        state.range_len = new_len;
        Ok(())
    }
}

fn contains(start_id: u64, range_len: u64, msg_id: u64) -> bool {
    msg_id >= start_id && msg_id - start_id < range_len
}
