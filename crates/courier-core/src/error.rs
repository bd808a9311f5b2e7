//! Error taxonomy for the courier client.
//!
//! Every public operation either returns a well-typed result or fails
//! with exactly one [`CourierError`] kind. Faults scoped to a single
//! message (a bad response id, one malformed notification) are contained
//! and logged by the session; faults that threaten session integrity
//! escalate to the faulted state and fail all pending calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`CourierError`].
pub type CourierResult<T> = Result<T, CourierError>;

/// Top-level error type for the courier client.
#[derive(Debug, Error)]
pub enum CourierError {
    /// A transport-level read, write, or connect failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A malformed envelope that could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Protocol version negotiation failed, or an operation was attempted
    /// before the handshake completed.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The server answered the call with a JSON-RPC error object. This is
    /// a successful protocol exchange carrying an application failure,
    /// not a fault of the session.
    #[error("server error {}: {}", .0.code, .0.message)]
    Application(ErrorObject),

    /// The session was closed or faulted while the operation was pending,
    /// or an operation was attempted on a closed session.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The call was cancelled, explicitly or by timeout.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The operation is outside the server's negotiated capability set.
    /// Raised before any transport write.
    #[error("capability error: {0}")]
    Capability(String),

    /// A JSON (de)serialization failure outside envelope decoding, e.g.
    /// an unparseable `result` payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport-level failures with a uniform surface across transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A read or write on the underlying channel failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The server process could not be spawned.
    #[error("failed to spawn server process: {0}")]
    Spawn(String),

    /// The channel is closed; no further messages will flow.
    #[error("connection closed")]
    Closed,

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer did not answer within the transport's deadline.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success HTTP status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Any other HTTP plumbing failure.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl TransportError {
    /// Whether this failure is transient and worth retrying.
    ///
    /// Connection resets, timeouts, and overload statuses are transient;
    /// a closed channel or a failed spawn is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::Status(code) => matches!(code, 408 | 429 | 500..=599),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Self::Closed | Self::Spawn(_) | Self::Http(_) => false,
        }
    }
}

/// A JSON-RPC error object carried inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code defined by the protocol or the server.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured error details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    /// Creates an error object without structured details.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}
