//! Centralized error types for Codevec.

use codevec_redis::RedisError;
use thiserror::Error;

/// Main error type for Codevec operations.
#[derive(Error, Debug)]
pub enum CodevecError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Broker error: {0}")]
    Broker(#[from] RedisError),

    #[error("Worker execution failed: {0}")]
    WorkerExecution(String),

    #[error("Malformed stream payload: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Codevec operations.
pub type CodevecResult<T> = Result<T, CodevecError>;

impl CodevecError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failure is a broker link problem that recovers by
    /// reconnecting, as opposed to one that must be surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Broker(e) if e.is_transient())
    }
}
