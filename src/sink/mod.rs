//! The sink: an OTLP gRPC endpoint that feeds acks into the tracker.

pub mod rpc;

pub use rpc::{LogSink, MetricSink, TraceSink};

use crate::core::Result;
use crate::tracker::Tracker;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::LogsServiceServer;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsServiceServer;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceServiceServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;

/// The OTLP data-plane server of the verification side.
pub struct Sink {
    addr: String,
    tracker: Arc<Tracker>,
}

/// Handle for a running sink.
pub struct SinkHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SinkHandle {
    /// The address the sink actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gracefully stop the server.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            tracing::error!(%err, "sink server task failed");
        }
    }
}

impl Sink {
    /// Create a sink listening on `addr` and acking into `tracker`.
    pub fn new(addr: impl Into<String>, tracker: Arc<Tracker>) -> Self {
        Self {
            addr: addr.into(),
            tracker,
        }
    }

    /// Bind and serve the OTLP trace, logs, and metrics services. Returns
    /// once the listener is bound.
    pub async fn start(self) -> Result<SinkHandle> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "sink listening");

        let trace_service = TraceServiceServer::new(TraceSink::new(Arc::clone(&self.tracker)))
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(trace_service)
                .add_service(LogsServiceServer::new(LogSink))
                .add_service(MetricsServiceServer::new(MetricSink))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(err) = result {
                tracing::error!(%err, "sink server error");
            }
        });

        Ok(SinkHandle {
            local_addr,
            shutdown,
            handle,
        })
    }
}
