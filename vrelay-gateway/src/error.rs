//! Gateway error types.

use hyper::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use vrelay_protocol::ProtocolError;
use vrelay_transport::Endpoint;

/// Failure of one round trip to the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("reply too large: {size} bytes (max {max})")]
    ReplyTooLarge { size: usize, max: usize },
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TransportError::Io(e),
            ProtocolError::MessageTooLarge { size, max } => {
                TransportError::ReplyTooLarge { size, max }
            }
            other => TransportError::Protocol(other),
        }
    }
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// HTTP status reported to the gateway's caller.
    pub fn status_code(&self) -> StatusCode {
        if self.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::BAD_GATEWAY
        }
    }
}

/// Errors that stop the HTTP listener.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
