//! Wire types shared by the control client and server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a control message announces about its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// A freshly allocated range.
    New,
    /// A truncation of an earlier announcement (`range_len` is the new length).
    Update,
}

/// JSON body of `POST`/`PUT /api/message_range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAnnouncement {
    /// Opaque per-worker generator identity.
    pub generator_id: String,
    /// Creation time of the range on the generator, RFC-3339.
    pub timestamp: DateTime<Utc>,
    /// First message ID of the range.
    pub start_id: u64,
    /// Number of message IDs in the range.
    pub range_len: u64,
}

/// One message on the in-process control channel.
#[derive(Debug, Clone)]
pub struct Control {
    /// Announcement or truncation.
    pub kind: ControlKind,
    /// The range being announced.
    pub range: RangeAnnouncement,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_json_round_trip() {
        let announcement = RangeAnnouncement {
            generator_id: "d5f9a6e0-7b1c-4f1d-9f61-2f4f7a2a9c3b".to_string(),
            timestamp: "2025-03-14T09:26:53.589Z".parse().unwrap(),
            start_id: 1001,
            range_len: 1000,
        };

        let json = serde_json::to_string(&announcement).unwrap();
        let decoded: RangeAnnouncement = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, announcement);
    }

    #[test]
    fn test_announcement_field_names() {
        let announcement = RangeAnnouncement {
            generator_id: "g".to_string(),
            timestamp: Utc::now(),
            start_id: 1,
            range_len: 2,
        };

        let value = serde_json::to_value(&announcement).unwrap();
        assert!(value.get("generator_id").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("start_id").is_some());
        assert!(value.get("range_len").is_some());
    }
}
