use thiserror::Error;

/// Errors produced anywhere in the connector.
///
/// Codec and single-connection failures stay inside the worker layer,
/// where they become quarantine decisions. Callers of the balancer only
/// ever observe [`AjpError::ServiceUnavailable`].
#[derive(Error, Debug)]
pub enum AjpError {
    #[error("Message overflow: {needed} bytes needed, capacity {capacity}")]
    Overflow { needed: usize, capacity: usize },

    #[error("Destination too small: {required} bytes required, capacity {capacity}")]
    Capacity { required: usize, capacity: usize },

    #[error("Protocol framing error: {0}")]
    Framing(String),

    #[error("Endpoint is not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Timed out after {0}ms waiting for a pooled endpoint")]
    PoolTimeout(u64),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Backend answered with failure status {0}")]
    BackendStatus(u16),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Status interface is read-only")]
    ReadOnly,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AjpError {
    /// Whether this error is a pool backpressure signal rather than a
    /// failure of the backend itself.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, AjpError::PoolTimeout(_) | AjpError::PoolExhausted(_))
    }

    /// Whether this error came from a socket level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AjpError::Timeout(_))
    }
}

impl From<std::net::AddrParseError> for AjpError {
    fn from(err: std::net::AddrParseError) -> Self {
        AjpError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AjpError>;
