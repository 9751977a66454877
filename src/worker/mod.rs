//! Worker pool: owns the worker fibers, their pacing, shared statistics,
//! and the shutdown order.

pub mod msg_id;

pub use msg_id::{IdTagger, MsgId, MsgIdGenerator, NoopIdTagger, ALLOC_SIZE};

use crate::control::ControlClient;
use crate::core::{Result, SpanfloodError};
use crate::stats::{StatDomain, StatsTracker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

/// Capability set of a worker type.
///
/// `start` is called once per fiber; each call spawns one fiber that owns
/// the given identity tagger. `stop_all` asks every spawned fiber to finish
/// its in-flight push and exit, and waits for them.
#[async_trait]
pub trait Worker: Send {
    /// Bind the worker to its statistics domain and the shared HTTP client.
    async fn init(&mut self, stats: Arc<StatDomain>, client: reqwest::Client) -> Result<()>;

    /// Spawn one worker fiber pushing a batch every `push_interval`.
    async fn start(&mut self, push_interval: Duration, tagger: Box<dyn IdTagger>) -> Result<()>;

    /// Stop and await all fibers spawned by this worker.
    async fn stop_all(&mut self);
}

/// Pool-level configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fibers per registered worker type.
    pub workers: usize,
    /// Batch push cadence per fiber.
    pub push_interval: Duration,
    /// Statistics report cadence.
    pub report_interval: Duration,
    /// Control server base URL, if range announcements are wanted.
    pub control_endpoint: Option<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct RegisteredWorker {
    domain: String,
    worker: Box<dyn Worker>,
}

/// Owns N fibers per registered worker type plus the statistics and
/// control-client fibers. Lifecycle: Idle -> Running -> Stopping -> Stopped.
pub struct WorkerPool {
    cfg: PoolConfig,
    workers: Vec<RegisteredWorker>,
    stats: Arc<StatsTracker>,
    control: Option<ControlClient>,
    http_client: reqwest::Client,
    stats_stop: Option<watch::Sender<bool>>,
    stats_handle: Option<JoinHandle<()>>,
    state: PoolState,
}

impl WorkerPool {
    /// Create an empty pool. The shared HTTP client carries the transport
    /// tuning used for both OTLP/HTTP export and health probing.
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let control = cfg.control_endpoint.clone().map(ControlClient::new);

        Ok(Self {
            cfg,
            workers: Vec::new(),
            stats: Arc::new(StatsTracker::new()),
            control,
            http_client,
            stats_stop: None,
            stats_handle: None,
            state: PoolState::Idle,
        })
    }

    /// Register a worker type under a statistics domain.
    pub async fn add(&mut self, domain: &str, mut worker: Box<dyn Worker>) -> Result<()> {
        worker.init(self.stats.domain(domain), self.http_client.clone()).await?;
        self.workers.push(RegisteredWorker {
            domain: domain.to_string(),
            worker,
        });
        Ok(())
    }

    /// Start the control client, all worker fibers, and the stats fiber.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != PoolState::Idle {
            return Err(SpanfloodError::config("worker pool already started"));
        }

        if let Some(control) = &mut self.control {
            control.start();
        }
        let ctrl_sender = self.control.as_ref().map(ControlClient::sender);

        for registered in &mut self.workers {
            for _ in 0..self.cfg.workers {
                let tagger = Box::new(MsgIdGenerator::new(
                    Uuid::new_v4().to_string(),
                    ctrl_sender.clone(),
                ));
                registered.worker.start(self.cfg.push_interval, tagger).await?;
            }
            tracing::info!(
                domain = %registered.domain,
                fibers = self.cfg.workers,
                "worker fibers started"
            );
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let report_interval = self.cfg.report_interval;
        self.stats_stop = Some(stop_tx);
        self.stats_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + report_interval,
                report_interval,
            );
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => print_stats(&stats),
                }
            }
        }));

        self.state = PoolState::Running;
        Ok(())
    }

    /// Stop everything, in order: stats fiber, worker fibers (each finishes
    /// its in-flight push and flushes its range truncation), control client
    /// (drains the channel). Idempotent after the first call.
    pub async fn stop(&mut self) {
        if self.state != PoolState::Running {
            return;
        }
        self.state = PoolState::Stopping;

        if let Some(stop) = self.stats_stop.take() {
            let _ = stop.send(true);
        }
        if let Some(handle) = self.stats_handle.take() {
            let _ = handle.await;
        }

        for registered in &mut self.workers {
            registered.worker.stop_all().await;
            tracing::info!(domain = %registered.domain, "worker fibers stopped");
        }

        if let Some(control) = self.control.take() {
            control.stop().await;
        }

        self.state = PoolState::Stopped;
    }
}

fn print_stats(stats: &StatsTracker) {
    let reports = stats.report(Instant::now());

    for (domain, domain_reports) in reports {
        if domain_reports.is_empty() {
            continue;
        }
        let joined: Vec<String> = domain_reports.iter().map(ToString::to_string).collect();
        println!("REPORT: [{}] {}", domain, joined.join(", "));
    }
}
