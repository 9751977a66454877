//! Hierarchical throughput counters for the worker pool.
//!
//! Workers bump atomic counters on the hot path; the report fiber
//! periodically snapshots them and turns the deltas into rate lines.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The statistics a worker can report, with display metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Uncompressed protobuf bytes handed to the transport.
    BytesSent,
    /// Compressed bytes on the wire (HTTP export only).
    BytesSentCompressed,
    /// Export requests issued.
    BatchesSent,
    /// Spans issued.
    SpansSent,
}

impl StatKind {
    fn label(self) -> &'static str {
        match self {
            Self::BytesSent => "bytes",
            Self::BytesSentCompressed => "bytesZ",
            Self::BatchesSent => "batches",
            Self::SpansSent => "spans",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Self::BytesSent | Self::BytesSentCompressed => "MiB",
            Self::BatchesSent => "batches",
            Self::SpansSent => "spans",
        }
    }

    fn scale(self) -> f64 {
        match self {
            Self::BytesSent | Self::BytesSentCompressed => 1024.0 * 1024.0,
            Self::BatchesSent | Self::SpansSent => 1.0,
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    last_value: u64,
    last_report: Option<Instant>,
}

/// A single counter. `incr` is the hot path; the snapshot is only ever
/// touched by the report fiber.
#[derive(Debug)]
pub struct Stat {
    kind: StatKind,
    value: AtomicU64,
    snapshot: Mutex<Snapshot>,
}

impl Stat {
    fn new(kind: StatKind) -> Self {
        Self {
            kind,
            value: AtomicU64::new(0),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Add `delta` to the counter.
    pub fn incr(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Advance the snapshot and return the delta since the last report.
    /// The first observation only primes the snapshot.
    fn report(&self, now: Instant) -> Option<StatReport> {
        let mut snapshot = self.snapshot.lock();
        let value = self.value.load(Ordering::Relaxed);

        let Some(last_report) = snapshot.last_report else {
            snapshot.last_report = Some(now);
            snapshot.last_value = value;
            return None;
        };

        let report = StatReport {
            kind: self.kind,
            delta: value - snapshot.last_value,
            duration: now.duration_since(last_report),
        };
        snapshot.last_report = Some(now);
        snapshot.last_value = value;
        Some(report)
    }
}

/// One stat's movement over a report window.
#[derive(Debug, Clone, Copy)]
pub struct StatReport {
    /// Which counter moved.
    pub kind: StatKind,
    /// Increase since the previous report.
    pub delta: u64,
    /// Length of the report window.
    pub duration: Duration,
}

impl fmt::Display for StatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.duration.as_secs_f64();
        let rate = if secs > 0.0 {
            self.delta as f64 / secs / self.kind.scale()
        } else {
            0.0
        };
        write!(f, "{} {} ({:.2} {}/sec)", self.delta, self.kind.label(), rate, self.kind.unit())
    }
}

/// The counters of one statistics domain (one registered worker type).
#[derive(Debug, Default)]
pub struct StatDomain {
    stats: Mutex<HashMap<StatKind, Arc<Stat>>>,
}

impl StatDomain {
    /// Get or register the counter for `kind`.
    pub fn stat(&self, kind: StatKind) -> Arc<Stat> {
        let mut stats = self.stats.lock();
        Arc::clone(stats.entry(kind).or_insert_with(|| Arc::new(Stat::new(kind))))
    }

    fn report(&self, now: Instant) -> Vec<StatReport> {
        let stats: Vec<Arc<Stat>> = self.stats.lock().values().cloned().collect();

        let mut reports: Vec<StatReport> =
            stats.iter().filter_map(|s| s.report(now)).collect();
        reports.sort_by_key(|r| r.kind.label());
        reports
    }
}

/// Top-level registry of statistics domains.
#[derive(Debug, Default)]
pub struct StatsTracker {
    domains: RwLock<HashMap<String, Arc<StatDomain>>>,
}

impl StatsTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the domain named `name`.
    pub fn domain(&self, name: &str) -> Arc<StatDomain> {
        {
            let domains = self.domains.read();
            if let Some(domain) = domains.get(name) {
                return Arc::clone(domain);
            }
        }

        let mut domains = self.domains.write();
        Arc::clone(domains.entry(name.to_string()).or_default())
    }

    /// Snapshot every domain. Domains whose stats are all still priming
    /// produce empty vectors.
    pub fn report(&self, now: Instant) -> HashMap<String, Vec<StatReport>> {
        let domains: Vec<(String, Arc<StatDomain>)> = {
            let guard = self.domains.read();
            guard.iter().map(|(name, d)| (name.clone(), Arc::clone(d))).collect()
        };

        domains
            .into_iter()
            .map(|(name, domain)| (name, domain.report(now)))
            .collect()
    }
}
