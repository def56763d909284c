//! Error types for a3s-audit

use thiserror::Error;

/// Errors raised inside the observability sinks
///
/// None of these ever reach a business handler: the façade and
/// `RecentActivityLog::record` swallow them after logging and counting.
#[derive(Debug, Error)]
pub enum ObserveError {
    /// Cache unreachable after all connection attempts
    #[error("Connection error: {0}")]
    Connection(String),

    /// Cache command failure on an established connection
    #[error("Cache error: {0}")]
    Cache(String),

    /// Broker publish failure
    #[error("Failed to publish audit event to topic '{topic}': {reason}")]
    Publish {
        topic: String,
        reason: String,
    },

    /// Broker consumer creation or read failure
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Broker stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Span or metric exporter failure
    #[error("Telemetry export error: {0}")]
    Export(String),
}

/// Result type alias for observability operations
pub type Result<T> = std::result::Result<T, ObserveError>;

/// Failure reported by a relational-store collaborator
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Business-level failures returned to the caller of a handler
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed request fields
    #[error("{0}")]
    BadRequest(String),

    /// No authenticated actor, or bad credentials
    #[error("{0}")]
    Unauthorized(String),

    /// Username already registered; reported as a bad request
    #[error("{0}")]
    Conflict(String),

    /// Relational store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Anything else that went wrong while serving the request
    #[error("{0}")]
    Internal(String),
}

impl From<ObserveError> for ApiError {
    fn from(e: ObserveError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl ApiError {
    /// HTTP status code for this error
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) | ApiError::Conflict(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Store(_) | ApiError::Internal(_) => 500,
        }
    }

    /// JSON error body in the backend's response envelope
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        })
    }
}
