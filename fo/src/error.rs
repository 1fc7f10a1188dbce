//! Fanout error types

use procbus::BusError;
use thiserror::Error;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from scatter-gather operations
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Not connected: call connect() before requesting messages")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(#[source] BusError),

    #[error("Discovery error: {0}")]
    Discovery(#[source] BusError),

    #[error("Delivery to instance {instance_id} failed: {source}")]
    Delivery {
        instance_id: u32,
        #[source]
        source: BusError,
    },

    #[error("{topic} timed out after {timeout_ms}ms ({outstanding} replies outstanding)")]
    Timeout {
        topic: String,
        timeout_ms: u64,
        outstanding: usize,
    },

    #[error("Handler not found for topic: {0}")]
    HandlerNotFound(String),

    #[error("Handler for {topic} failed: {source}")]
    Handler {
        topic: String,
        #[source]
        source: HandlerError,
    },

    #[error("Topic must be a non-empty string")]
    EmptyTopic,

    #[error("Request id already pending: {0}")]
    DuplicateRequest(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl FanoutError {
    /// Whether this is an aggregation timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result alias for fanout operations
pub type FanoutResult<T> = Result<T, FanoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = FanoutError::Timeout {
            topic: "ping".to_string(),
            timeout_ms: 500,
            outstanding: 2,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "ping timed out after 500ms (2 replies outstanding)");
    }

    #[test]
    fn test_delivery_keeps_bus_error_as_source() {
        use std::error::Error;

        let err = FanoutError::Delivery {
            instance_id: 3,
            source: BusError::InstanceOffline(3),
        };
        assert!(err.to_string().contains("instance 3"));
        assert!(err.source().is_some());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_handler_error_from_string() {
        let source: HandlerError = "boom".into();
        let err = FanoutError::Handler {
            topic: "stats".to_string(),
            source,
        };
        assert_eq!(err.to_string(), "Handler for stats failed: boom");
    }
}
