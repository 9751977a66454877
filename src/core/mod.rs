//! Core domain types shared across the generator and sink roles.

pub mod config;
pub mod error;

pub use config::{parse_endpoint, parse_headers, GeneratorConfig, SinkConfig};
pub use error::{Result, SpanfloodError};
