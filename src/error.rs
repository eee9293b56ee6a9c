use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ProtocolError, RequestId};

/// Coarse classification of a [`BridgeError`], so callers can branch on the
/// kind of failure without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No usable peer. Retry once a new extension connects.
    ConnectionUnavailable,
    /// A frame did not have the expected shape.
    Protocol,
    /// The peer reported a failure for this request.
    Remote,
    /// No response arrived before the deadline.
    Timeout,
    /// The request was abandoned (server shutdown or dropped slot).
    Cancelled,
    /// The page state could not be obtained or assembled.
    State,
    /// The server itself could not start.
    Server,
}

/// Errors surfaced to callers of the request/response layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no active extension connection")]
    NoActiveConnection,

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("connection {0} lost while sending request")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    #[error("extension error: {0}")]
    Remote(String),

    #[error("request {id} ({request_type}) timed out after {after:?}")]
    Timeout {
        id: RequestId,
        request_type: String,
        after: Duration,
    },

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("state error: {0}")]
    State(String),

    #[error("could not parse state: {0}")]
    StateParse(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NoActiveConnection
            | BridgeError::ConnectionClosed(_)
            | BridgeError::ConnectionLost(_) => ErrorKind::ConnectionUnavailable,
            BridgeError::Protocol(_) | BridgeError::DuplicateRequestId(_) => ErrorKind::Protocol,
            BridgeError::Remote(_) => ErrorKind::Remote,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::Cancelled(_) => ErrorKind::Cancelled,
            BridgeError::State(_) | BridgeError::StateParse(_) => ErrorKind::State,
            BridgeError::Bind { .. } => ErrorKind::Server,
        }
    }

    /// Shutdown error delivered to every request still pending when the
    /// server stops.
    pub fn shutting_down() -> Self {
        BridgeError::Cancelled("server shutting down".to_string())
    }
}
