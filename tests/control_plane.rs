//! Control-plane HTTP contract tests.
//!
//! Exercises the announcement endpoint against a real loopback server:
//! status codes, validation, and the tracker effects of announcements and
//! truncations racing the data plane.

use chrono::Utc;
use spanflood_lib::control::{ControlServer, ControlServerHandle, RangeAnnouncement};
use spanflood_lib::tracker::Tracker;
use std::sync::Arc;
use std::time::Duration;

async fn start_server() -> (Arc<Tracker>, ControlServerHandle, String) {
    let tracker = Arc::new(Tracker::new());
    let server = ControlServer::new("127.0.0.1:0", Arc::clone(&tracker), Duration::from_secs(3600));
    let handle = server.start().await.expect("control server should bind");
    let url = format!("http://{}/api/message_range", handle.local_addr());
    (tracker, handle, url)
}

fn announcement(generator_id: &str, start_id: u64, range_len: u64) -> RangeAnnouncement {
    RangeAnnouncement {
        generator_id: generator_id.to_string(),
        timestamp: Utc::now(),
        start_id,
        range_len,
    }
}

#[tokio::test]
async fn test_announce_creates_range() {
    let (tracker, handle, url) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(&url)
        .json(&announcement("gen1", 1, 1000))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let report = tracker.generator_report(Utc::now() + chrono::Duration::hours(1));
    assert_eq!(report["gen1"].unacked, 1000);

    handle.stop().await;
}

#[tokio::test]
async fn test_truncate_shrinks_range() {
    let (tracker, handle, url) = start_server().await;
    let client = reqwest::Client::new();

    client
        .post(&url)
        .json(&announcement("gen1", 1, 1000))
        .send()
        .await
        .unwrap();

    for id in 1..=600u64 {
        tracker.ack("gen1", 1, 1000, id);
    }

    let response = client
        .put(&url)
        .json(&announcement("gen1", 1, 600))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let report = tracker.generator_report(Utc::now() + chrono::Duration::hours(1));
    assert_eq!(report["gen1"].unacked, 0);
    assert_eq!(report["gen1"].total_acked, 600);

    handle.stop().await;
}

#[tokio::test]
async fn test_method_not_allowed() {
    let (_tracker, handle, url) = start_server().await;
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let response = client.delete(&url).send().await.unwrap();
    assert_eq!(response.status(), 405);

    handle.stop().await;
}

#[tokio::test]
async fn test_validation_failures() {
    let (tracker, handle, url) = start_server().await;
    let client = reqwest::Client::new();

    // Malformed JSON.
    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Empty generator ID.
    let response = client
        .post(&url)
        .json(&announcement("", 1, 1000))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Zero-length range.
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "generator_id": "gen1",
            "timestamp": "2025-03-14T09:26:53Z",
            "start_id": 1,
            "range_len": 0,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // None of the rejected requests touched the tracker.
    assert!(tracker.generator_report(Utc::now() + chrono::Duration::hours(1)).is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_late_announcement_installs_timestamp_only() {
    let (tracker, handle, url) = start_server().await;
    let client = reqwest::Client::new();

    // Data plane beats the control plane: acks create the range lazily.
    for id in 1..=100u64 {
        tracker.ack("gen1", 1, 1000, id);
    }
    let report = tracker.generator_report(Utc::now() + chrono::Duration::hours(1));
    // No timestamp yet, so nothing counts as old.
    assert_eq!(report["gen1"].unacked, 0);
    assert_eq!(report["gen1"].total_acked, 100);

    let response = client
        .post(&url)
        .json(&announcement("gen1", 1, 1000))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Acked bits survived; the range now has an age.
    let report = tracker.generator_report(Utc::now() + chrono::Duration::hours(1));
    assert_eq!(report["gen1"].unacked, 900);
    assert_eq!(report["gen1"].total_acked, 100);
    assert!(tracker.is_acked("gen1", 1, 50));

    handle.stop().await;
}
