//! OTLP envelope helpers: resource and scope descriptors, wire IDs.

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use rand::RngCore;

/// Schema URL stamped on emitted resource and scope spans.
pub const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.37.0";

fn string_attr(key: &str, value: String) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value)),
        }),
    }
}

fn int_attr(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

/// Build the stable resource descriptor for one worker fiber.
///
/// `worker_idx` distinguishes fibers, `resource_idx` the resources within
/// a batch; together they give downstream partitioners something to fan
/// out on.
pub fn new_resource(worker_idx: u64, resource_idx: usize) -> Resource {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    Resource {
        attributes: vec![
            string_attr("service.name", "loadtest".to_string()),
            int_attr("service.instance.id", worker_idx as i64),
            string_attr("k8s.pod.name", format!("pod-{}", resource_idx)),
            string_attr("host.name", host),
        ],
        dropped_attributes_count: 0,
    }
}

/// Build the shared instrumentation scope for emitted spans.
pub fn new_scope() -> InstrumentationScope {
    InstrumentationScope {
        name: "spanflood_worker".to_string(),
        version: "1.2.3".to_string(),
        attributes: vec![string_attr("telemetry.sdk.name", "rust".to_string())],
        dropped_attributes_count: 0,
    }
}

/// Generate a random trace, span, or parent ID of `num_bytes` bytes.
///
/// A valid W3C ID cannot be all zeros; in that vanishingly unlikely draw
/// the first byte is forced to 1.
pub fn otel_id(num_bytes: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);

    if bytes.iter().all(|&b| b == 0) {
        bytes[0] = 1;
    }

    bytes
}
