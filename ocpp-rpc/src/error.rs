//! Error taxonomy for the correlation core
//!
//! Each layer has its own error type so callers can tell apart a bad frame
//! (contained, the session keeps reading) from a failed call (returned to the
//! caller) and from a dead transport (closes the session).

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::frame::ErrorCode;
use crate::session::SessionState;

/// Errors decoding a single inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type id: {0}")]
    UnknownMessageTypeId(i64),
}

/// Errors issuing a call or writing to a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not open (state: {0:?})")]
    SessionNotOpen(SessionState),

    #[error("call id already pending: {0}")]
    DuplicateCallId(String),

    #[error("outbound queue full")]
    QueueFull,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure reported by an action handler, sent back to the peer as a CALLERROR
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: String,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Payload could not be interpreted for this action
    pub fn formation(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::FormationViolation, err.to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::formation(err)
    }
}

/// Errors from the action dispatcher
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("handler already registered for action: {0}")]
    DuplicateHandler(String),

    #[error("no handler registered for action: {0}")]
    UnhandledAction(String),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// Why an outbound call did not produce a result payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error("remote error {code}: {description}")]
    Remote {
        code: String,
        description: String,
        details: Value,
    },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("call rejected: {0}")]
    Rejected(#[from] SessionError),
}

impl CallFailure {
    /// The remote error code, if the peer answered with a CALLERROR
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            CallFailure::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Errors raised by a transport collaborator
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL or handshake request: {0}")]
    InvalidRequest(String),

    #[error("non UTF-8 binary frame")]
    InvalidUtf8,

    #[error("transport closed")]
    Closed,
}
