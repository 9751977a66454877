//! OTLP service implementations backing the sink.
//!
//! Only the trace service verifies delivery; logs and metrics exports are
//! answered with empty success so the sink can stand in for a full
//! collector endpoint.

use crate::tracker::Tracker;
use crate::worker::msg_id::{extract_generator_id, extract_msg_id};
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::LogsService;
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsService;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceService;
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Trace service that acks every identity-carrying span into the tracker.
pub struct TraceSink {
    tracker: Arc<Tracker>,
    anonymous_spans: AtomicU64,
}

impl TraceSink {
    /// Create a trace sink feeding `tracker`.
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            tracker,
            anonymous_spans: AtomicU64::new(0),
        }
    }

    /// Spans received without a usable identity since startup.
    pub fn anonymous_spans(&self) -> u64 {
        self.anonymous_spans.load(Ordering::Relaxed)
    }
}

#[tonic::async_trait]
impl TraceService for TraceSink {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> std::result::Result<Response<ExportTraceServiceResponse>, Status> {
        for resource_spans in request.into_inner().resource_spans {
            let Some(resource) = resource_spans.resource else {
                continue;
            };

            let Some(generator_id) = extract_generator_id(&resource.attributes) else {
                let spans: u64 = resource_spans
                    .scope_spans
                    .iter()
                    .map(|ss| ss.spans.len() as u64)
                    .sum();
                self.anonymous_spans.fetch_add(spans, Ordering::Relaxed);
                tracing::debug!("resource without generator identity, skipping verification");
                continue;
            };

            for scope_spans in resource_spans.scope_spans {
                for otel_span in scope_spans.spans {
                    match extract_msg_id(&otel_span.attributes) {
                        Some(msg_id) => {
                            self.tracker.ack(
                                generator_id,
                                msg_id.start_id,
                                msg_id.range_len,
                                msg_id.id,
                            );
                        },
                        None => {
                            self.anonymous_spans.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("span without message identity, skipping");
                        },
                    }
                }
            }
        }

        // The export always succeeds; loss shows up in the tracker report.
        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: None,
        }))
    }
}

/// Logs service that acknowledges everything without verification.
pub struct LogSink;

#[tonic::async_trait]
impl LogsService for LogSink {
    async fn export(
        &self,
        _request: Request<ExportLogsServiceRequest>,
    ) -> std::result::Result<Response<ExportLogsServiceResponse>, Status> {
        Ok(Response::new(ExportLogsServiceResponse {
            partial_success: None,
        }))
    }
}

/// Metrics service that acknowledges everything without verification.
pub struct MetricSink;

#[tonic::async_trait]
impl MetricsService for MetricSink {
    async fn export(
        &self,
        _request: Request<ExportMetricsServiceRequest>,
    ) -> std::result::Result<Response<ExportMetricsServiceResponse>, Status> {
        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::msg_id::{
        ELEM_ATTR_MESSAGE_ID, ELEM_ATTR_RANGE_LEN, ELEM_ATTR_START_RANGE, RES_ATTR_GENERATOR_ID,
    };
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

    fn identified_span(start_id: u64, range_len: u64, id: u64) -> Span {
        let int_attr = |key: &str, value: i64| KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::IntValue(value)),
            }),
        };
        Span {
            attributes: vec![
                int_attr(ELEM_ATTR_START_RANGE, start_id as i64),
                int_attr(ELEM_ATTR_RANGE_LEN, range_len as i64),
                int_attr(ELEM_ATTR_MESSAGE_ID, id as i64),
            ],
            ..Default::default()
        }
    }

    fn export_request(generator_id: &str, spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![KeyValue {
                        key: RES_ATTR_GENERATOR_ID.to_string(),
                        value: Some(AnyValue {
                            value: Some(any_value::Value::StringValue(generator_id.to_string())),
                        }),
                    }],
                    dropped_attributes_count: 0,
                }),
                scope_spans: vec![ScopeSpans {
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_export_acks_identified_spans() {
        let tracker = Arc::new(Tracker::new());
        let sink = TraceSink::new(Arc::clone(&tracker));

        let spans = (1..=10).map(|id| identified_span(1, 1000, id)).collect();
        let response = sink.export(Request::new(export_request("gen1", spans))).await.unwrap();
        assert!(response.into_inner().partial_success.is_none());

        for id in 1..=10 {
            assert!(tracker.is_acked("gen1", 1, id));
        }
        assert_eq!(sink.anonymous_spans(), 0);
    }

    #[tokio::test]
    async fn test_export_skips_anonymous_spans() {
        let tracker = Arc::new(Tracker::new());
        let sink = TraceSink::new(Arc::clone(&tracker));

        let spans = vec![identified_span(1, 1000, 1), Span::default()];
        sink.export(Request::new(export_request("gen1", spans))).await.unwrap();

        assert!(tracker.is_acked("gen1", 1, 1));
        assert_eq!(sink.anonymous_spans(), 1);
    }

    #[tokio::test]
    async fn test_export_skips_unidentified_resources() {
        let tracker = Arc::new(Tracker::new());
        let sink = TraceSink::new(Arc::clone(&tracker));

        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource::default()),
                scope_spans: vec![ScopeSpans {
                    spans: vec![identified_span(1, 1000, 1)],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let response = sink.export(Request::new(request)).await.unwrap();
        assert!(response.into_inner().partial_success.is_none());
        assert!(tracker.acked_count().is_empty());
        assert_eq!(sink.anonymous_spans(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_counted() {
        let tracker = Arc::new(Tracker::new());
        let sink = TraceSink::new(Arc::clone(&tracker));

        let spans: Vec<Span> = (1..=5).map(|id| identified_span(1, 1000, id)).collect();
        sink.export(Request::new(export_request("gen1", spans.clone()))).await.unwrap();
        sink.export(Request::new(export_request("gen1", spans))).await.unwrap();

        let report = tracker.generator_report(chrono::Utc::now());
        assert_eq!(report["gen1"].total_acked, 5);
        assert_eq!(report["gen1"].total_duped, 5);
    }
}
