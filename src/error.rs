//! Error taxonomy for connection handling.
//!
//! Every failure is local to one connection: the event loop logs it, closes
//! that connection and keeps serving the rest.

use std::io;
use std::time::Duration;

/// A malformed or unsupported request. Fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid header")]
    InvalidHeader,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("more than {0} headers")]
    TooManyHeaders(usize),
    #[error("body exceeds {0} bytes")]
    BodyTooLarge(u64),
}

/// Failure reported by a request handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a connection was torn down.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Policy closure, not a failure of the peer.
    #[error("idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

impl ConnectionError {
    /// Whether this closure should be reported as a fault.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ConnectionError::IdleTimeout(_))
    }
}
