//! Backend error types.

use std::time::Duration;
use thiserror::Error;
use vrelay_transport::Endpoint;

/// Errors raised by the listener and per-connection handling.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] vrelay_protocol::ProtocolError),

    #[error("no complete envelope within {0:?}")]
    ReadTimeout(Duration),
}

impl BackendError {
    /// Returns whether the error stops the listener (only a failed bind does).
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Bind { .. })
    }
}

/// Failure while producing a reply for a decoded document.
#[derive(Debug, Error)]
pub enum BusinessError {
    #[error("request is not an envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("reply too large: {size} bytes (max {max})")]
    ReplyTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Handler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bind_is_fatal() {
        let bind = BackendError::Bind {
            endpoint: Endpoint::tcp("0.0.0.0", 9001),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(bind.to_string().contains("tcp://0.0.0.0:9001"));

        let accept = BackendError::Accept(std::io::Error::from(std::io::ErrorKind::Other));
        assert!(!accept.is_fatal());
        assert!(!BackendError::ReadTimeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_business_error_display() {
        let err = BusinessError::Handler("database unavailable".to_string());
        assert_eq!(err.to_string(), "database unavailable");

        let json_err = serde_json::from_str::<Vec<u8>>("{}").unwrap_err();
        let err = BusinessError::from(json_err);
        assert!(err.to_string().starts_with("request is not an envelope"));
    }
}
