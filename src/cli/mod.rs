//! Command-line interface.
//!
//! Two roles: `gen traces` drives the worker pool against an OTLP
//! endpoint; `sink` terminates the data plane and hosts the control
//! server.

use crate::control::ControlServer;
use crate::core::{parse_endpoint, parse_headers, GeneratorConfig, Result, SinkConfig};
use crate::sink::Sink;
use crate::telemetry::TracesWorker;
use crate::tracker::Tracker;
use crate::worker::{PoolConfig, WorkerPool};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

/// Distributed OTLP load generator with end-to-end delivery verification.
#[derive(Parser, Debug)]
#[command(name = "spanflood")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, env = "SPANFLOOD_DEBUG", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate synthetic OTLP traffic.
    Gen(GenArgs),
    /// Run the verification sink and control server.
    Sink(SinkArgs),
}

/// Flags shared by every generator signal.
#[derive(Args, Debug)]
pub struct GenArgs {
    /// OTLP endpoint for exporting telemetry.
    #[arg(long, global = true, default_value = "localhost:4317")]
    pub otlp_endpoint: String,

    /// Number of resources per exported batch.
    #[arg(long, global = true, default_value_t = 1)]
    pub otlp_resources_per_batch: usize,

    /// How long to run the generator; 0 runs until interrupted.
    #[arg(long, global = true, default_value = "0s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Interval between statistics reports.
    #[arg(long, global = true, default_value = "3s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,

    /// Interval between batch pushes per worker.
    #[arg(long, global = true, default_value = "50ms", value_parser = humantime::parse_duration)]
    pub push_interval: Duration,

    /// How many concurrent workers to run.
    #[arg(long, global = true, default_value_t = 1)]
    pub workers: usize,

    /// Endpoint of the control server for range announcements.
    #[arg(long, global = true)]
    pub control_endpoint: Option<String>,

    /// Extra export header as KEY=VALUE; repeatable.
    #[arg(long = "header", global = true, value_name = "KEY=VALUE")]
    pub headers: Vec<String>,

    #[command(subcommand)]
    pub signal: GenSignal,
}

/// Telemetry signals the generator can produce.
#[derive(Subcommand, Debug)]
pub enum GenSignal {
    /// Generate OTLP trace spans.
    Traces(TracesArgs),
}

/// Trace-specific flags.
#[derive(Args, Debug)]
pub struct TracesArgs {
    /// How many trace spans per resource to generate.
    #[arg(long, default_value_t = 100)]
    pub spans_per_resource: usize,

    /// Use OTLP/HTTP instead of gRPC for export.
    #[arg(long)]
    pub http: bool,
}

/// Flags for the sink role.
#[derive(Args, Debug)]
pub struct SinkArgs {
    /// Data-plane (OTLP gRPC) address to listen on.
    #[arg(long, default_value = "localhost:5317")]
    pub addr: String,

    /// Control-plane (HTTP) address to listen on.
    #[arg(long, default_value = "localhost:5000")]
    pub control_addr: String,

    /// Interval between tracker reports.
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Initialize logging. REPORT lines bypass the logger and go straight
    /// to stdout.
    pub fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let default_level = if self.debug { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| {
                crate::core::SpanfloodError::config(format!("failed to initialize logging: {}", e))
            })?;

        Ok(())
    }
}

/// Run the selected command to completion.
pub async fn execute(cli: Cli) -> Result<()> {
    cli.init_logging()?;

    match cli.command {
        Command::Gen(gen) => match gen.signal {
            GenSignal::Traces(ref traces) => run_traces(&gen, traces).await,
        },
        Command::Sink(sink) => run_sink(&sink).await,
    }
}

async fn run_traces(gen: &GenArgs, traces: &TracesArgs) -> Result<()> {
    let config = GeneratorConfig {
        otlp_endpoint: parse_endpoint(&gen.otlp_endpoint)?,
        use_grpc: !traces.http,
        resources_per_batch: gen.otlp_resources_per_batch,
        spans_per_resource: traces.spans_per_resource,
        workers: gen.workers,
        push_interval: gen.push_interval,
        report_interval: gen.report_interval,
        duration: (!gen.duration.is_zero()).then_some(gen.duration),
        control_endpoint: gen
            .control_endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?,
        headers: parse_headers(&gen.headers)?,
    };
    config.validate()?;

    let mut pool = WorkerPool::new(PoolConfig {
        workers: config.workers,
        push_interval: config.push_interval,
        report_interval: config.report_interval,
        control_endpoint: config.control_endpoint.clone(),
    })?;

    let worker = TracesWorker::new(
        config.otlp_endpoint.clone(),
        config.use_grpc,
        config.resources_per_batch,
        config.spans_per_resource,
        config.headers.clone(),
    );
    pool.add("otlp-traces", Box::new(worker)).await?;

    pool.start().await?;
    tracing::info!(endpoint = %config.otlp_endpoint, "load generator started");

    wait_for_shutdown(config.duration).await;

    tracing::info!("shutting down");
    pool.stop().await;
    Ok(())
}

async fn run_sink(args: &SinkArgs) -> Result<()> {
    let config = SinkConfig {
        addr: args.addr.clone(),
        control_addr: args.control_addr.clone(),
        report_interval: args.report_interval,
    };
    config.validate()?;

    let tracker = Arc::new(Tracker::new());

    let sink = Sink::new(&config.addr, Arc::clone(&tracker)).start().await?;
    let control = ControlServer::new(&config.control_addr, tracker, config.report_interval)
        .start()
        .await?;

    tracing::info!(
        sink = %sink.local_addr(),
        control = %control.local_addr(),
        "sink started"
    );

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");

    control.stop().await;
    sink.stop().await;
    Ok(())
}

async fn wait_for_shutdown(duration: Option<Duration>) {
    match duration {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    tracing::info!(duration = ?limit, "reached test duration");
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received");
                },
            }
        },
        None => {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_gen_traces() {
        let cli = Cli::parse_from([
            "spanflood",
            "gen",
            "traces",
            "--otlp-endpoint",
            "collector:4317",
            "--spans-per-resource",
            "10",
            "--workers",
            "4",
            "--push-interval",
            "25ms",
            "--header",
            "x-api-key=abc",
            "--http",
        ]);

        let Command::Gen(gen) = cli.command else {
            panic!("expected gen command");
        };
        assert_eq!(gen.otlp_endpoint, "collector:4317");
        assert_eq!(gen.workers, 4);
        assert_eq!(gen.push_interval, Duration::from_millis(25));
        assert_eq!(gen.headers, vec!["x-api-key=abc".to_string()]);

        let GenSignal::Traces(traces) = gen.signal;
        assert_eq!(traces.spans_per_resource, 10);
        assert!(traces.http);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["spanflood", "gen", "traces"]);
        let Command::Gen(gen) = cli.command else {
            panic!("expected gen command");
        };

        assert_eq!(gen.otlp_endpoint, "localhost:4317");
        assert_eq!(gen.otlp_resources_per_batch, 1);
        assert_eq!(gen.duration, Duration::ZERO);
        assert_eq!(gen.report_interval, Duration::from_secs(3));
        assert_eq!(gen.push_interval, Duration::from_millis(50));
        assert_eq!(gen.workers, 1);
        assert!(gen.control_endpoint.is_none());
    }

    #[test]
    fn test_cli_parses_sink() {
        let cli = Cli::parse_from(["spanflood", "sink", "--addr", "0.0.0.0:4317"]);
        let Command::Sink(sink) = cli.command else {
            panic!("expected sink command");
        };

        assert_eq!(sink.addr, "0.0.0.0:4317");
        assert_eq!(sink.control_addr, "localhost:5000");
        assert_eq!(sink.report_interval, Duration::from_secs(3));
    }
}
