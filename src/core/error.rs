use thiserror::Error;

/// Error type covering every subsystem of the load generator.
#[derive(Error, Debug)]
pub enum SpanfloodError {
    #[error("OTLP protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("control plane error: {0}")]
    Control(String),

    #[error("collector rejected {0} spans")]
    SpansRejected(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("GRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("GRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for spanflood operations.
pub type Result<T> = std::result::Result<T, SpanfloodError>;

impl SpanfloodError {
    /// Creates a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new network error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a new control-plane error.
    pub fn control<S: Into<String>>(msg: S) -> Self {
        Self::Control(msg.into())
    }

    /// Returns true if retrying the operation could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Http(_) => true,
            Self::Grpc(status) => {
                matches!(status.code(), tonic::Code::Unavailable | tonic::Code::DeadlineExceeded)
            },
            _ => false,
        }
    }
}
