//! Redis connection pool management.

use redis::aio::ConnectionManager;
use thiserror::Error;

/// Redis error types.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker link lost: {0}")]
    LinkLost(String),
}

impl RedisError {
    /// Whether the error describes a broken or unreachable broker link that a
    /// caller may recover from by reconnecting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            Self::LinkLost(_) => true,
            Self::Serialization(_) => false,
        }
    }
}

/// Result type for Redis operations.
pub type RedisResult<T> = Result<T, RedisError>;

/// Redis connection pool. ConnectionManager handles multiplexing and
/// reconnection internally; callers clone it to get a mutable handle.
pub type RedisPool = ConnectionManager;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_lost_is_transient() {
        assert!(RedisError::LinkLost("closed".into()).is_transient());
    }

    #[test]
    fn test_serialization_is_not_transient() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!RedisError::from(err).is_transient());
    }
}
