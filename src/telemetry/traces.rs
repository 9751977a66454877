//! OTLP trace generation: batch construction and export.
//!
//! Each fiber builds one `ExportTraceServiceRequest` per push tick: a fixed
//! set of resources decorated with the generator identity, each carrying a
//! chain of spans under a fresh trace ID. Export goes over gRPC (gzip
//! request compression) or OTLP/HTTP (gzipped protobuf body).

use crate::core::{Result, SpanfloodError};
use crate::otlp;
use crate::stats::{Stat, StatDomain, StatKind};
use crate::worker::{IdTagger, Worker};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, ResourceSpans, ScopeSpans, Span};
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{MetadataKey, MetadataMap};
use tonic::transport::{Channel, Endpoint};
use url::Url;

const GRPC_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const SPAN_STEP_NANOS: u64 = 10_000_000;
const EVENT_OFFSET_NANOS: u64 = 5_000_000;

// Rotated by span index for realistic-looking telemetry.
const SPAN_NAMES: [&str; 10] = [
    "http_request",
    "database_query",
    "cache_get",
    "service_call",
    "file_read",
    "authentication",
    "message_publish",
    "queue_consume",
    "template_render",
    "json_parse",
];

fn span_name(index: usize) -> &'static str {
    SPAN_NAMES[index % SPAN_NAMES.len()]
}

#[derive(Clone)]
struct FiberStats {
    bytes_sent: Arc<Stat>,
    bytes_sent_z: Arc<Stat>,
    batches_sent: Arc<Stat>,
    spans_sent: Arc<Stat>,
}

#[derive(Clone)]
struct Transport {
    http_client: reqwest::Client,
    http_headers: HeaderMap,
    grpc_client: Option<TraceServiceClient<Channel>>,
    stats: FiberStats,
}

/// The traces worker type: spawns one export fiber per `start` call.
pub struct TracesWorker {
    endpoint: Url,
    use_grpc: bool,
    resources_per_batch: usize,
    spans_per_resource: usize,
    headers: HashMap<String, String>,
    next_fiber_idx: u64,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
    transport: Option<Transport>,
}

impl TracesWorker {
    /// Create a traces worker. For HTTP export, an endpoint without a path
    /// gets the standard `/v1/traces`.
    pub fn new(
        mut endpoint: Url,
        use_grpc: bool,
        resources_per_batch: usize,
        spans_per_resource: usize,
        headers: HashMap<String, String>,
    ) -> Self {
        if !use_grpc && (endpoint.path().is_empty() || endpoint.path() == "/") {
            endpoint.set_path("/v1/traces");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            endpoint,
            use_grpc,
            resources_per_batch,
            spans_per_resource,
            headers,
            next_fiber_idx: 0,
            stop_tx,
            stop_rx,
            handles: Vec::new(),
            transport: None,
        }
    }

    fn grpc_origin(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or("localhost");
        let port = self.endpoint.port_or_known_default().unwrap_or(4317);
        format!("{}://{}:{}", self.endpoint.scheme(), host, port)
    }

    fn http_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        for (key, value) in &self.headers {
            match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                },
                _ => tracing::warn!(header = %key, "skipping invalid HTTP header"),
            }
        }
        headers
    }

    fn grpc_metadata(&self, fiber_idx: u64) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        if let Ok(value) = format!("127.0.0.{}", fiber_idx).parse() {
            metadata.insert("x-forwarded-for", value);
        }
        for (key, value) in &self.headers {
            let name = MetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes());
            match (name, value.parse()) {
                (Ok(name), Ok(value)) => {
                    metadata.insert(name, value);
                },
                _ => tracing::warn!(header = %key, "skipping invalid gRPC metadata header"),
            }
        }
        metadata
    }
}

#[async_trait]
impl Worker for TracesWorker {
    async fn init(&mut self, stats: Arc<StatDomain>, client: reqwest::Client) -> Result<()> {
        let grpc_client = if self.use_grpc {
            // Lazy connect so the generator can come up before the sink.
            let channel = Endpoint::from_shared(self.grpc_origin())?
                .connect_lazy();
            Some(
                TraceServiceClient::new(channel)
                    .send_compressed(CompressionEncoding::Gzip)
                    .accept_compressed(CompressionEncoding::Gzip),
            )
        } else {
            None
        };

        self.transport = Some(Transport {
            http_client: client,
            http_headers: self.http_headers(),
            grpc_client,
            stats: FiberStats {
                bytes_sent: stats.stat(StatKind::BytesSent),
                bytes_sent_z: stats.stat(StatKind::BytesSentCompressed),
                batches_sent: stats.stat(StatKind::BatchesSent),
                spans_sent: stats.stat(StatKind::SpansSent),
            },
        });

        Ok(())
    }

    async fn start(&mut self, push_interval: Duration, tagger: Box<dyn IdTagger>) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| SpanfloodError::config("traces worker not initialized"))?;

        self.next_fiber_idx += 1;
        let fiber = Fiber {
            idx: self.next_fiber_idx,
            endpoint: self.endpoint.clone(),
            use_grpc: self.use_grpc,
            resources_per_batch: self.resources_per_batch,
            spans_per_resource: self.spans_per_resource,
            metadata: self.grpc_metadata(self.next_fiber_idx),
            transport,
        };

        let stop_rx = self.stop_rx.clone();
        self.handles.push(tokio::spawn(fiber.push_loop(push_interval, tagger, stop_rx)));
        Ok(())
    }

    async fn stop_all(&mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(%err, "traces fiber panicked");
            }
        }
    }
}

struct Fiber {
    idx: u64,
    endpoint: Url,
    use_grpc: bool,
    resources_per_batch: usize,
    spans_per_resource: usize,
    metadata: MetadataMap,
    transport: Transport,
}

impl Fiber {
    async fn push_loop(
        mut self,
        push_interval: Duration,
        mut tagger: Box<dyn IdTagger>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Resources are stable for the fiber's lifetime; only spans vary.
        let mut resources = Vec::with_capacity(self.resources_per_batch);
        for i in 0..self.resources_per_batch {
            let mut resource = otlp::new_resource(self.idx, i);
            tagger.tag_resource(&mut resource.attributes);
            resources.push(resource);
        }
        let scope = otlp::new_scope();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + push_interval,
            push_interval,
        );
        // Missed ticks don't accumulate beyond one.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    let batch =
                        build_batch(&resources, &scope, self.spans_per_resource, tagger.as_mut())
                            .await;
                    if let Err(err) = self.push(batch).await {
                        tracing::error!(%err, fiber = self.idx, "export failed, stopping fiber");
                        break;
                    }
                }
            }
        }

        tagger.finish().await;
    }

    async fn push(&mut self, batch: Vec<ResourceSpans>) -> Result<()> {
        let span_count = (self.resources_per_batch * self.spans_per_resource) as u64;
        if self.use_grpc {
            self.push_grpc(batch, span_count).await
        } else {
            self.push_http(batch, span_count).await
        }
    }

    async fn push_grpc(&mut self, batch: Vec<ResourceSpans>, span_count: u64) -> Result<()> {
        let client = self
            .transport
            .grpc_client
            .as_mut()
            .ok_or_else(|| SpanfloodError::config("gRPC client missing"))?;

        let msg = ExportTraceServiceRequest {
            resource_spans: batch,
        };
        let raw_len = msg.encoded_len() as u64;

        let mut request = tonic::Request::new(msg);
        *request.metadata_mut() = self.metadata.clone();
        request.set_timeout(GRPC_CALL_TIMEOUT);

        let response = client.export(request).await?;
        if let Some(partial) = response.into_inner().partial_success {
            if partial.rejected_spans != 0 {
                return Err(SpanfloodError::SpansRejected(partial.rejected_spans));
            }
        }

        let stats = &self.transport.stats;
        stats.bytes_sent.incr(raw_len);
        stats.batches_sent.incr(1);
        stats.spans_sent.incr(span_count);
        Ok(())
    }

    async fn push_http(&mut self, batch: Vec<ResourceSpans>, span_count: u64) -> Result<()> {
        let msg = ExportTraceServiceRequest {
            resource_spans: batch,
        };
        let buf = msg.encode_to_vec();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&buf)?;
        let compressed = encoder.finish()?;
        let compressed_len = compressed.len() as u64;

        // Fake source address so downstream partitioners spread the load.
        let forwarded_for = format!("127.0.0.{}", self.idx);

        let response = self
            .transport
            .http_client
            .post(self.endpoint.clone())
            .headers(self.transport.http_headers.clone())
            .header("x-forwarded-for", forwarded_for)
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "unexpected status code from OTLP endpoint");
            return Err(SpanfloodError::protocol(format!("OTLP/HTTP export returned {}", status)));
        }

        let stats = &self.transport.stats;
        stats.bytes_sent.incr(buf.len() as u64);
        stats.bytes_sent_z.incr(compressed_len);
        stats.batches_sent.incr(1);
        stats.spans_sent.incr(span_count);
        Ok(())
    }
}

/// Build one export batch: for every resource, a fresh trace ID and a chain
/// of `spans_per_resource` spans (span i > 0 parents span i - 1).
async fn build_batch(
    resources: &[Resource],
    scope: &InstrumentationScope,
    spans_per_resource: usize,
    tagger: &mut dyn IdTagger,
) -> Vec<ResourceSpans> {
    let mut resource_spans = Vec::with_capacity(resources.len());

    for resource in resources {
        let trace_id = otlp::otel_id(16);
        let now_nano = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let end_time = now_nano + spans_per_resource as u64 * SPAN_STEP_NANOS;

        let mut spans: Vec<Span> = Vec::with_capacity(spans_per_resource);
        for i in 0..spans_per_resource {
            let start_time = now_nano + i as u64 * SPAN_STEP_NANOS;

            let mut attributes = vec![KeyValue {
                key: "index".to_string(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::IntValue(i as i64)),
                }),
            }];
            tagger.tag_span(&mut attributes).await;

            let parent_span_id = if i > 0 {
                spans[i - 1].span_id.clone()
            } else {
                Vec::new()
            };

            spans.push(Span {
                trace_id: trace_id.clone(),
                span_id: otlp::otel_id(8),
                trace_state: "active".to_string(),
                parent_span_id,
                name: span_name(i).to_string(),
                kind: span::SpanKind::Server as i32,
                start_time_unix_nano: start_time,
                end_time_unix_nano: end_time,
                attributes,
                events: vec![span::Event {
                    time_unix_nano: start_time + EVENT_OFFSET_NANOS,
                    name: "db-connect".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            });
        }

        resource_spans.push(ResourceSpans {
            resource: Some(resource.clone()),
            scope_spans: vec![ScopeSpans {
                scope: Some(scope.clone()),
                spans,
                schema_url: otlp::SCHEMA_URL.to_string(),
            }],
            schema_url: otlp::SCHEMA_URL.to_string(),
        });
    }

    resource_spans
}
