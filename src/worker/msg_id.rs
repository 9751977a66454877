//! Message identity: allocation on the generator, extraction at the sink.
//!
//! Every worker fiber owns one [`MsgIdGenerator`]. IDs are issued in strict
//! ascending order starting at 1, carved out of fixed-width ranges; each
//! allocation is announced on the control channel, and an undrained range
//! is truncated when the fiber shuts down.

use crate::control::{Control, ControlKind, RangeAnnouncement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use tokio::sync::mpsc;

/// Width of every allocated message-ID range.
pub const ALLOC_SIZE: u64 = 1000;

/// Resource attribute carrying the generator identity.
pub const RES_ATTR_GENERATOR_ID: &str = "loadgen.generator.id";
/// Span attribute: first ID of the range the span's ID belongs to.
pub const ELEM_ATTR_START_RANGE: &str = "loadgen.range.start";
/// Span attribute: length of that range.
pub const ELEM_ATTR_RANGE_LEN: &str = "loadgen.range.len";
/// Span attribute: the span's own message ID.
pub const ELEM_ATTR_MESSAGE_ID: &str = "loadgen.message.id";

/// The identity triple carried on every emitted span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgId {
    /// First ID of the owning range.
    pub start_id: u64,
    /// Length of the owning range.
    pub range_len: u64,
    /// This message's ID, with `start_id <= id < start_id + range_len`.
    pub id: u64,
}

/// Capability set of a message identity source.
///
/// `tag_span` may suspend: allocating a new range posts on the bounded
/// control channel, and a full channel is deliberate backpressure on range
/// issuance.
#[async_trait]
pub trait IdTagger: Send {
    /// Decorate resource attributes with the generator identity.
    fn tag_resource(&self, attrs: &mut Vec<KeyValue>);

    /// Consume one message ID and append the identity triple to `attrs`.
    async fn tag_span(&mut self, attrs: &mut Vec<KeyValue>);

    /// Flush shutdown state (truncation of an undrained range).
    async fn finish(&mut self);
}

#[derive(Debug)]
struct IdRange {
    start_id: u64,
    len: u64,
    used: u64,
    timestamp: DateTime<Utc>,
}

impl IdRange {
    fn is_full(&self) -> bool {
        self.used >= self.len
    }

    fn next_id(&mut self) -> MsgId {
        debug_assert!(!self.is_full(), "next_id called on a full range");

        let id = self.start_id + self.used;
        self.used += 1;
        MsgId {
            start_id: self.start_id,
            range_len: self.len,
            id,
        }
    }
}

/// The real identity source: allocates ranges of [`ALLOC_SIZE`] IDs and
/// announces them on the control channel.
pub struct MsgIdGenerator {
    generator_id: String,
    next_start_id: u64,
    ctrl: Option<mpsc::Sender<Control>>,
    current: Option<IdRange>,
}

impl MsgIdGenerator {
    /// Create a generator. `ctrl` is `None` when no control endpoint is
    /// configured; allocation then skips announcements entirely.
    pub fn new(generator_id: String, ctrl: Option<mpsc::Sender<Control>>) -> Self {
        Self {
            generator_id,
            next_start_id: 1,
            ctrl,
            current: None,
        }
    }

    /// The opaque generator identity.
    pub fn generator_id(&self) -> &str {
        &self.generator_id
    }

    async fn announce(&self, kind: ControlKind, start_id: u64, range_len: u64, timestamp: DateTime<Utc>) {
        let Some(ctrl) = &self.ctrl else { return };

        let control = Control {
            kind,
            range: RangeAnnouncement {
                generator_id: self.generator_id.clone(),
                timestamp,
                start_id,
                range_len,
            },
        };
        if ctrl.send(control).await.is_err() {
            tracing::warn!(
                generator_id = %self.generator_id,
                start_id,
                "control channel closed, dropping range announcement"
            );
        }
    }

    async fn next_range(&mut self, len: u64) -> IdRange {
        let range = IdRange {
            start_id: self.next_start_id,
            len,
            used: 0,
            timestamp: Utc::now(),
        };
        self.next_start_id += len;

        self.announce(ControlKind::New, range.start_id, range.len, range.timestamp).await;
        range
    }

    /// Issue the next message ID, allocating a fresh range when the current
    /// one is exhausted.
    pub async fn next_id(&mut self) -> MsgId {
        if self.current.as_ref().map_or(true, IdRange::is_full) {
            self.current = Some(self.next_range(ALLOC_SIZE).await);
        }

        self.current
            .as_mut()
            .expect("range allocated above")
            .next_id()
    }
}

#[async_trait]
impl IdTagger for MsgIdGenerator {
    fn tag_resource(&self, attrs: &mut Vec<KeyValue>) {
        attrs.push(KeyValue {
            key: RES_ATTR_GENERATOR_ID.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(self.generator_id.clone())),
            }),
        });
    }

    async fn tag_span(&mut self, attrs: &mut Vec<KeyValue>) {
        let msg_id = self.next_id().await;

        for (key, value) in [
            (ELEM_ATTR_START_RANGE, msg_id.start_id),
            (ELEM_ATTR_RANGE_LEN, msg_id.range_len),
            (ELEM_ATTR_MESSAGE_ID, msg_id.id),
        ] {
            attrs.push(KeyValue {
                key: key.to_string(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::IntValue(value as i64)),
                }),
            });
        }
    }

    async fn finish(&mut self) {
        let Some(range) = self.current.take() else { return };

        if range.used < range.len {
            self.announce(ControlKind::Update, range.start_id, range.used, range.timestamp).await;
        }
    }
}

/// Identity transform on attributes: no identity allocated, nothing
/// announced. Used when delivery verification is not wanted.
pub struct NoopIdTagger;

#[async_trait]
impl IdTagger for NoopIdTagger {
    fn tag_resource(&self, _attrs: &mut Vec<KeyValue>) {}

    async fn tag_span(&mut self, _attrs: &mut Vec<KeyValue>) {}

    async fn finish(&mut self) {}
}

/// Pull the generator identity off resource attributes, if present and
/// string-typed.
pub fn extract_generator_id(attrs: &[KeyValue]) -> Option<&str> {
    attrs.iter().find_map(|attr| {
        if attr.key != RES_ATTR_GENERATOR_ID {
            return None;
        }
        match attr.value.as_ref()?.value.as_ref()? {
            any_value::Value::StringValue(s) => Some(s.as_str()),
            _ => None,
        }
    })
}

/// Pull the identity triple off span attributes. Any missing or
/// wrong-typed component yields `None`.
pub fn extract_msg_id(attrs: &[KeyValue]) -> Option<MsgId> {
    let mut start_id = None;
    let mut range_len = None;
    let mut id = None;

    for attr in attrs {
        match attr.key.as_str() {
            ELEM_ATTR_START_RANGE => start_id = Some(int_value(attr)?),
            ELEM_ATTR_RANGE_LEN => range_len = Some(int_value(attr)?),
            ELEM_ATTR_MESSAGE_ID => id = Some(int_value(attr)?),
            _ => {},
        }
        if start_id.is_some() && range_len.is_some() && id.is_some() {
            break;
        }
    }

    Some(MsgId {
        start_id: start_id? as u64,
        range_len: range_len? as u64,
        id: id? as u64,
    })
}

fn int_value(attr: &KeyValue) -> Option<i64> {
    match attr.value.as_ref()?.value.as_ref()? {
        any_value::Value::IntValue(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_attr(key: &str, value: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::IntValue(value)),
            }),
        }
    }

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    #[tokio::test]
    async fn test_ids_monotonic_from_one() {
        let mut gen = MsgIdGenerator::new("gen".to_string(), None);

        for expected in 1..=2500u64 {
            let msg_id = gen.next_id().await;
            assert_eq!(msg_id.id, expected);
            assert_eq!(msg_id.range_len, ALLOC_SIZE);
            assert!(msg_id.start_id <= msg_id.id);
            assert!(msg_id.id < msg_id.start_id + msg_id.range_len);
        }
    }

    #[tokio::test]
    async fn test_range_boundaries() {
        let mut gen = MsgIdGenerator::new("gen".to_string(), None);

        let first = gen.next_id().await;
        assert_eq!(first.start_id, 1);

        for _ in 1..ALLOC_SIZE {
            gen.next_id().await;
        }
        let next = gen.next_id().await;
        assert_eq!(next.start_id, 1 + ALLOC_SIZE);
        assert_eq!(next.id, 1 + ALLOC_SIZE);
    }

    #[tokio::test]
    async fn test_allocation_announced() {
        let (tx, mut rx) = mpsc::channel(100);
        let mut gen = MsgIdGenerator::new("gen".to_string(), Some(tx));

        gen.next_id().await;
        let control = rx.recv().await.unwrap();
        assert_eq!(control.kind, ControlKind::New);
        assert_eq!(control.range.generator_id, "gen");
        assert_eq!(control.range.start_id, 1);
        assert_eq!(control.range.range_len, ALLOC_SIZE);
    }

    #[tokio::test]
    async fn test_finish_truncates_undrained_range() {
        let (tx, mut rx) = mpsc::channel(100);
        let mut gen = MsgIdGenerator::new("gen".to_string(), Some(tx));

        for _ in 0..600 {
            gen.next_id().await;
        }
        gen.finish().await;

        let new = rx.recv().await.unwrap();
        assert_eq!(new.kind, ControlKind::New);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, ControlKind::Update);
        assert_eq!(update.range.start_id, 1);
        assert_eq!(update.range.range_len, 600);
    }

    #[tokio::test]
    async fn test_finish_skips_drained_range() {
        let (tx, mut rx) = mpsc::channel(2000);
        let mut gen = MsgIdGenerator::new("gen".to_string(), Some(tx));

        for _ in 0..ALLOC_SIZE {
            gen.next_id().await;
        }
        gen.finish().await;
        drop(gen);

        let new = rx.recv().await.unwrap();
        assert_eq!(new.kind, ControlKind::New);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tagging_round_trip() {
        let mut gen = MsgIdGenerator::new("gen-xyz".to_string(), None);

        let mut res_attrs = Vec::new();
        gen.tag_resource(&mut res_attrs);
        assert_eq!(extract_generator_id(&res_attrs), Some("gen-xyz"));

        let mut span_attrs = Vec::new();
        gen.tag_span(&mut span_attrs).await;
        let msg_id = extract_msg_id(&span_attrs).unwrap();
        assert_eq!(msg_id, MsgId { start_id: 1, range_len: ALLOC_SIZE, id: 1 });
    }

    #[test]
    fn test_extract_high_start_id_round_trip() {
        let start = (1u64 << 63) - 1000;
        let attrs = vec![
            int_attr(ELEM_ATTR_START_RANGE, start as i64),
            int_attr(ELEM_ATTR_RANGE_LEN, 100),
            int_attr(ELEM_ATTR_MESSAGE_ID, (start + 99) as i64),
        ];

        let msg_id = extract_msg_id(&attrs).unwrap();
        assert_eq!(msg_id.start_id, start);
        assert_eq!(msg_id.id, start + 99);
    }

    #[test]
    fn test_extract_tolerates_missing_and_wrong_types() {
        // Missing one component.
        let attrs = vec![
            int_attr(ELEM_ATTR_START_RANGE, 1),
            int_attr(ELEM_ATTR_RANGE_LEN, 10),
        ];
        assert!(extract_msg_id(&attrs).is_none());

        // Wrong-typed component.
        let attrs = vec![
            int_attr(ELEM_ATTR_START_RANGE, 1),
            string_attr(ELEM_ATTR_RANGE_LEN, "10"),
            int_attr(ELEM_ATTR_MESSAGE_ID, 5),
        ];
        assert!(extract_msg_id(&attrs).is_none());

        // No attributes at all.
        assert!(extract_msg_id(&[]).is_none());
        assert!(extract_generator_id(&[]).is_none());

        // Wrong-typed generator ID.
        let attrs = vec![int_attr(RES_ATTR_GENERATOR_ID, 7)];
        assert!(extract_generator_id(&attrs).is_none());
    }

    #[tokio::test]
    async fn test_noop_tagger_is_identity() {
        let mut tagger = NoopIdTagger;

        let mut attrs = vec![string_attr("existing", "value")];
        tagger.tag_resource(&mut attrs);
        tagger.tag_span(&mut attrs).await;
        tagger.finish().await;
        assert_eq!(attrs.len(), 1);
    }
}
