//! Inbound side of the control plane.
//!
//! A small axum server accepting range announcements and truncations, plus
//! the periodic tracker report. The report lines on stdout are the primary
//! human surface for delivery loss and duplication.

use crate::control::types::RangeAnnouncement;
use crate::core::Result;
use crate::tracker::{GeneratorReport, Tracker};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The control-plane HTTP server and its report fiber.
pub struct ControlServer {
    addr: String,
    tracker: Arc<Tracker>,
    report_interval: Duration,
}

/// Handle for a running control server.
pub struct ControlServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    serve_handle: JoinHandle<()>,
    report_handle: JoinHandle<()>,
}

impl ControlServerHandle {
    /// The address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the server and its report fiber down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.serve_handle.await {
            tracing::error!(%err, "control server task failed");
        }
        if let Err(err) = self.report_handle.await {
            tracing::error!(%err, "control report task failed");
        }
    }
}

#[derive(Clone)]
struct ServerState {
    tracker: Arc<Tracker>,
}

impl ControlServer {
    /// Create a server that will listen on `addr` and report every
    /// `report_interval`.
    pub fn new(addr: impl Into<String>, tracker: Arc<Tracker>, report_interval: Duration) -> Self {
        Self {
            addr: addr.into(),
            tracker,
            report_interval,
        }
    }

    /// Bind and start serving. Returns once the listener is bound.
    pub async fn start(self) -> Result<ControlServerHandle> {
        let state = ServerState {
            tracker: Arc::clone(&self.tracker),
        };

        let app = Router::new()
            .route("/api/message_range", post(handle_announce).put(handle_truncate))
            .with_state(state);

        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "control server listening");

        let (shutdown, shutdown_rx) = watch::channel(false);

        let serve_handle = {
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let graceful = async move {
                    let _ = rx.changed().await;
                };
                if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(graceful).await
                {
                    tracing::error!(%err, "control server error");
                }
            })
        };

        let report_handle = {
            let tracker = Arc::clone(&self.tracker);
            let interval = self.report_interval;
            let mut rx = shutdown_rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + interval,
                    interval,
                );
                loop {
                    tokio::select! {
                        _ = rx.changed() => return,
                        _ = ticker.tick() => print_report(&tracker, interval),
                    }
                }
            })
        };

        Ok(ControlServerHandle {
            local_addr,
            shutdown,
            serve_handle,
            report_handle,
        })
    }
}

fn print_report(tracker: &Tracker, report_interval: Duration) {
    let now = Utc::now();
    let cutoff = now
        - chrono::Duration::from_std(report_interval).unwrap_or_else(|_| chrono::Duration::zero());

    let reports = tracker.generator_report(cutoff);
    if reports.is_empty() {
        println!("REPORT: No load generators running");
        return;
    }

    println!("REPORT [{}]:", now.to_rfc3339());
    for (generator_id, report) in &reports {
        println!("\t{}", format_generator_line(generator_id, report));
    }
}

fn format_generator_line(generator_id: &str, report: &GeneratorReport) -> String {
    let mut line = format!(
        "Generator {}:\tTotal Acked: {},\tTotal Duped: {}",
        generator_id, report.total_acked, report.total_duped
    );

    if report.unacked > 0 {
        let age = report
            .oldest_unacked
            .and_then(|ts| (Utc::now() - ts).to_std().ok())
            .map(|age| humantime::format_duration(age).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let _ = write!(line, ",\tUnacked: {}, Age: {}", report.unacked, age);
    }

    line
}

async fn handle_announce(State(state): State<ServerState>, body: Bytes) -> Response {
    let announcement = match parse_announcement(&body) {
        Ok(a) => a,
        Err(response) => return response,
    };

    tracing::debug!(
        generator_id = %announcement.generator_id,
        start_id = announcement.start_id,
        range_len = announcement.range_len,
        "range announced"
    );
    state.tracker.add_range(
        &announcement.generator_id,
        announcement.start_id,
        announcement.range_len,
        announcement.timestamp,
    );

    ok_response()
}

async fn handle_truncate(State(state): State<ServerState>, body: Bytes) -> Response {
    let announcement = match parse_announcement(&body) {
        Ok(a) => a,
        Err(response) => return response,
    };

    tracing::debug!(
        generator_id = %announcement.generator_id,
        start_id = announcement.start_id,
        range_len = announcement.range_len,
        "range truncated"
    );
    state.tracker.update_range(
        &announcement.generator_id,
        announcement.start_id,
        announcement.range_len,
    );

    ok_response()
}

// Parsed by hand so malformed JSON maps to a plain 400 instead of axum's
// extractor rejections.
fn parse_announcement(body: &[u8]) -> std::result::Result<RangeAnnouncement, Response> {
    let announcement: RangeAnnouncement = serde_json::from_slice(body).map_err(|err| {
        (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", err)).into_response()
    })?;

    if announcement.generator_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "generator_id is required").into_response());
    }
    if announcement.range_len == 0 {
        return Err((StatusCode::BAD_REQUEST, "range_len is required").into_response());
    }

    Ok(announcement)
}

fn ok_response() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_parse_announcement_validation() {
        assert!(parse_announcement(b"not json").is_err());

        let missing_gen = serde_json::json!({
            "generator_id": "",
            "timestamp": "2025-03-14T09:26:53Z",
            "start_id": 1,
            "range_len": 10,
        });
        assert!(parse_announcement(missing_gen.to_string().as_bytes()).is_err());

        let zero_len = serde_json::json!({
            "generator_id": "gen",
            "timestamp": "2025-03-14T09:26:53Z",
            "start_id": 1,
            "range_len": 0,
        });
        assert!(parse_announcement(zero_len.to_string().as_bytes()).is_err());

        let valid = serde_json::json!({
            "generator_id": "gen",
            "timestamp": "2025-03-14T09:26:53Z",
            "start_id": 1,
            "range_len": 10,
        });
        let announcement = parse_announcement(valid.to_string().as_bytes()).unwrap();
        assert_eq!(announcement.start_id, 1);
        assert_eq!(announcement.range_len, 10);
    }

    #[test]
    fn test_generator_line_formats() {
        let report = GeneratorReport {
            unacked: 0,
            total_acked: 5000,
            total_duped: 0,
            oldest_unacked: None,
        };
        let line = format_generator_line("gen-1", &report);
        assert!(line.contains("Total Acked: 5000"));
        assert!(!line.contains("Unacked"));

        let report = GeneratorReport {
            unacked: 400,
            total_acked: 600,
            total_duped: 2,
            oldest_unacked: Some(Utc::now() - ChronoDuration::seconds(30)),
        };
        let line = format_generator_line("gen-1", &report);
        assert!(line.contains("Unacked: 400"));
        assert!(line.contains("Age:"));
    }
}
