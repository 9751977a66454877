//! Configuration for the generator and sink roles.
//!
//! Both roles are configured from CLI flags; the structs here carry the
//! validated values into the subsystems and serialize cleanly for
//! diagnostics dumps.

use crate::core::{Result, SpanfloodError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Configuration for the `gen traces` role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// OTLP endpoint batches are exported to.
    pub otlp_endpoint: Url,
    /// Export over gRPC (true) or OTLP/HTTP (false).
    pub use_grpc: bool,
    /// Resources per exported batch.
    pub resources_per_batch: usize,
    /// Spans per resource.
    pub spans_per_resource: usize,
    /// Concurrent worker fibers per worker type.
    pub workers: usize,
    /// Interval between batch pushes per fiber.
    #[serde(with = "humantime_serde")]
    pub push_interval: Duration,
    /// Interval between statistics reports.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Total run duration; `None` runs until interrupted.
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    /// Control server base URL for range announcements, if any.
    pub control_endpoint: Option<Url>,
    /// Extra headers attached to every export request.
    pub headers: HashMap<String, String>,
}

impl GeneratorConfig {
    /// Validate invariants the CLI layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SpanfloodError::config("workers must be > 0"));
        }
        if self.resources_per_batch == 0 {
            return Err(SpanfloodError::config("resources-per-batch must be > 0"));
        }
        if self.spans_per_resource == 0 {
            return Err(SpanfloodError::config("spans-per-resource must be > 0"));
        }
        if self.push_interval.is_zero() {
            return Err(SpanfloodError::config("push-interval must be > 0"));
        }
        if self.report_interval.is_zero() {
            return Err(SpanfloodError::config("report-interval must be > 0"));
        }
        Ok(())
    }
}

/// Configuration for the `sink` role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Data-plane (OTLP gRPC) listen address.
    pub addr: String,
    /// Control-plane (HTTP) listen address.
    pub control_addr: String,
    /// Interval between tracker reports.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

impl SinkConfig {
    /// Validate invariants the CLI layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(SpanfloodError::config("sink address must not be empty"));
        }
        if self.control_addr.is_empty() {
            return Err(SpanfloodError::config("control address must not be empty"));
        }
        if self.report_interval.is_zero() {
            return Err(SpanfloodError::config("report-interval must be > 0"));
        }
        Ok(())
    }
}

/// Normalize a user-supplied endpoint into a URL, defaulting to `http://`.
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let with_scheme = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    Ok(Url::parse(&with_scheme)?)
}

/// Parse repeatable `KEY=VALUE` header flags into a map.
pub fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::with_capacity(raw.len());
    for entry in raw {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            SpanfloodError::config(format!("invalid header {:?}, expected KEY=VALUE", entry))
        })?;
        if key.is_empty() {
            return Err(SpanfloodError::config(format!("empty header name in {:?}", entry)));
        }
        headers.insert(key.to_string(), value.to_string());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator_config() -> GeneratorConfig {
        GeneratorConfig {
            otlp_endpoint: parse_endpoint("localhost:4317").unwrap(),
            use_grpc: true,
            resources_per_batch: 1,
            spans_per_resource: 100,
            workers: 1,
            push_interval: Duration::from_millis(50),
            report_interval: Duration::from_secs(3),
            duration: None,
            control_endpoint: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_endpoint_normalization() {
        let url = parse_endpoint("localhost:4317").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(4317));

        let url = parse_endpoint("https://collector.example.com:4318").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_generator_config_validation() {
        assert!(generator_config().validate().is_ok());

        let mut cfg = generator_config();
        cfg.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = generator_config();
        cfg.push_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_header_parsing() {
        let headers =
            parse_headers(&["x-api-key=secret".to_string(), "x-tenant=acme".to_string()]).unwrap();
        assert_eq!(headers.get("x-api-key").map(String::as_str), Some("secret"));
        assert_eq!(headers.get("x-tenant").map(String::as_str), Some("acme"));

        assert!(parse_headers(&["no-equals".to_string()]).is_err());
        assert!(parse_headers(&["=value".to_string()]).is_err());
    }
}
