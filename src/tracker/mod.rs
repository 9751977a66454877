//! Concurrent delivery accounting for the sink.
//!
//! The tracker is the single canonical shared state of the verification
//! side: a map of generator IDs to their announced (or lazily discovered)
//! message ranges. Locks nest strictly outward-in: the generator map, then
//! a generator's range map, then an individual range; each guard is
//! released before the next level is taken.

pub mod range;

pub use range::{AckOutcome, MessageRange, RangeShrinkViolation};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-generator delivery summary for human display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorReport {
    /// Unacked messages across ranges older than the report cutoff.
    pub unacked: u64,
    /// Cumulative unique acks for the generator.
    pub total_acked: u64,
    /// Cumulative duplicate acks for the generator.
    pub total_duped: u64,
    /// Announcement time of the oldest range still missing messages.
    pub oldest_unacked: Option<DateTime<Utc>>,
}

/// Ranges and cumulative counters for a single generator.
///
/// The cumulative counters are atomics so report-time reads don't have to
/// walk the range map.
#[derive(Debug, Default)]
struct GeneratorTracker {
    ranges: RwLock<HashMap<u64, Arc<MessageRange>>>,
    total_acked: AtomicU64,
    total_duped: AtomicU64,
}

impl GeneratorTracker {
    fn find_or_create_range(&self, start_id: u64, range_len: u64) -> Arc<MessageRange> {
        {
            let ranges = self.ranges.read();
            if let Some(range) = ranges.get(&start_id) {
                return Arc::clone(range);
            }
        }

        let mut ranges = self.ranges.write();
        // Re-check: another acker may have created it between the locks.
        Arc::clone(
            ranges
                .entry(start_id)
                .or_insert_with(|| Arc::new(MessageRange::new(start_id, range_len))),
        )
    }

    fn ack(&self, start_id: u64, range_len: u64, msg_id: u64) -> AckOutcome {
        // A zero-length range can't contain anything; refuse before the
        // lazy-creation path asserts on it.
        if range_len == 0 {
            return AckOutcome::OutOfRange;
        }

        let range = self.find_or_create_range(start_id, range_len);
        let outcome = range.ack(msg_id);
        match outcome {
            AckOutcome::Fresh => {
                self.total_acked.fetch_add(1, Ordering::Relaxed);
            },
            AckOutcome::Duplicate => {
                self.total_duped.fetch_add(1, Ordering::Relaxed);
            },
            AckOutcome::OutOfRange => {},
        }
        outcome
    }

    fn add_range(&self, start_id: u64, range_len: u64, timestamp: DateTime<Utc>) {
        {
            let ranges = self.ranges.read();
            if let Some(range) = ranges.get(&start_id) {
                // Re-announcement (or a lazily created range catching up):
                // install the timestamp, never touch the length.
                range.set_timestamp(timestamp);
                return;
            }
        }

        let mut ranges = self.ranges.write();
        ranges
            .entry(start_id)
            .or_insert_with(|| Arc::new(MessageRange::with_timestamp(start_id, range_len, timestamp)))
            .set_timestamp(timestamp);
    }

    fn find_range(&self, start_id: u64) -> Option<Arc<MessageRange>> {
        self.ranges.read().get(&start_id).cloned()
    }

    fn unacked_older_than(&self, cutoff: DateTime<Utc>) -> (u64, Option<DateTime<Utc>>) {
        let ranges: Vec<Arc<MessageRange>> = self.ranges.read().values().cloned().collect();

        let mut total = 0;
        let mut oldest: Option<DateTime<Utc>> = None;
        for range in ranges {
            if !range.older_than(cutoff) {
                continue;
            }
            let unacked = range.unacked_count();
            if unacked > 0 {
                let ts = range.timestamp();
                if oldest.is_none() || ts < oldest {
                    oldest = ts;
                }
            }
            total += unacked;
        }
        (total, oldest)
    }

    fn acked_count(&self) -> u64 {
        let ranges: Vec<Arc<MessageRange>> = self.ranges.read().values().cloned().collect();
        ranges.iter().map(|r| r.acked_count()).sum()
    }
}

/// The sink-side tracker, keyed by generator ID.
///
/// Generators are created on demand and live for the rest of the run.
#[derive(Debug, Default)]
pub struct Tracker {
    generators: RwLock<HashMap<String, Arc<GeneratorTracker>>>,
}

impl Tracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn find_or_create_generator(&self, generator_id: &str) -> Arc<GeneratorTracker> {
        {
            let generators = self.generators.read();
            if let Some(gen) = generators.get(generator_id) {
                return Arc::clone(gen);
            }
        }

        let mut generators = self.generators.write();
        Arc::clone(generators.entry(generator_id.to_string()).or_default())
    }

    /// Record an ack for `msg_id` within the given range of a generator.
    ///
    /// An unseen generator or range is created on the spot: the data plane
    /// carries no ordering guarantee relative to the control plane, so the
    /// first ack for a range may well beat its announcement. Returns false
    /// only when the ID falls outside the (possibly truncated) range.
    pub fn ack(&self, generator_id: &str, start_id: u64, range_len: u64, msg_id: u64) -> bool {
        let gen = self.find_or_create_generator(generator_id);
        match gen.ack(start_id, range_len, msg_id) {
            AckOutcome::OutOfRange => {
                tracing::warn!(
                    generator_id,
                    start_id,
                    range_len,
                    msg_id,
                    "ack outside announced range"
                );
                false
            },
            AckOutcome::Fresh | AckOutcome::Duplicate => true,
        }
    }

    /// Announce a range for a generator without acking anything.
    ///
    /// On a second announcement of the same `start_id` only the timestamp
    /// is refreshed; the length recorded first (possibly from acks) wins.
    pub fn add_range(
        &self,
        generator_id: &str,
        start_id: u64,
        range_len: u64,
        timestamp: DateTime<Utc>,
    ) {
        let gen = self.find_or_create_generator(generator_id);
        gen.add_range(start_id, range_len, timestamp);
    }

    /// Truncate a previously announced range.
    ///
    /// Unknown generators, unknown ranges, and truncations that would drop
    /// an acked message are logged and ignored.
    pub fn update_range(&self, generator_id: &str, start_id: u64, range_len: u64) {
        let gen = {
            let generators = self.generators.read();
            generators.get(generator_id).cloned()
        };

        let Some(gen) = gen else {
            tracing::warn!(generator_id, start_id, "range update for unknown generator");
            return;
        };

        let Some(range) = gen.find_range(start_id) else {
            tracing::warn!(generator_id, start_id, "range update for unknown range");
            return;
        };

        if let Err(err) = range.set_range_len(range_len) {
            tracing::warn!(generator_id, %err, "rejected range update");
        }
    }

    /// Whether a message ID was acked. Unknown generators and ranges are
    /// simply not acked.
    pub fn is_acked(&self, generator_id: &str, start_id: u64, msg_id: u64) -> bool {
        let gen = {
            let generators = self.generators.read();
            generators.get(generator_id).cloned()
        };

        gen.and_then(|g| g.find_range(start_id))
            .is_some_and(|r| r.is_acked(msg_id))
    }

    /// Unique acks per generator, summed across ranges. Generators with
    /// zero acks are omitted.
    pub fn acked_count(&self) -> HashMap<String, u64> {
        let generators: Vec<(String, Arc<GeneratorTracker>)> = {
            let guard = self.generators.read();
            guard.iter().map(|(id, gen)| (id.clone(), Arc::clone(gen))).collect()
        };

        generators
            .into_iter()
            .filter_map(|(id, gen)| {
                let acked = gen.acked_count();
                (acked > 0).then_some((id, acked))
            })
            .collect()
    }

    /// One report per known generator. `unacked` and `oldest_unacked` are
    /// scoped to ranges announced before `cutoff`; the cumulative counters
    /// are not.
    pub fn generator_report(&self, cutoff: DateTime<Utc>) -> HashMap<String, GeneratorReport> {
        let generators: Vec<(String, Arc<GeneratorTracker>)> = {
            let guard = self.generators.read();
            guard.iter().map(|(id, gen)| (id.clone(), Arc::clone(gen))).collect()
        };

        generators
            .into_iter()
            .map(|(id, gen)| {
                let (unacked, oldest_unacked) = gen.unacked_older_than(cutoff);
                let report = GeneratorReport {
                    unacked,
                    total_acked: gen.total_acked.load(Ordering::Relaxed),
                    total_duped: gen.total_duped.load(Ordering::Relaxed),
                    oldest_unacked,
                };
                (id, report)
            })
            .collect()
    }
}
