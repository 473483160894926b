//! Common error types for remotesync.
//!
//! Transport libraries report failures as human-readable strings. Those
//! strings enter the taxonomy through [`Error::from_remote`], which is the
//! only place message signatures are inspected. Once a structured error code
//! is available from a transport, classify on that instead.

use std::time::Duration;
use thiserror::Error;

/// Message fragments that identify a broken or unusable transport.
const CONNECTION_SIGNATURES: &[&str] = &[
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "etimedout",
    "timed out",
    "ehostunreach",
    "enetunreach",
    "unreachable",
    "epipe",
    "broken pipe",
    "socket",
    "closed",
    "ended",
    "disconnected",
    "not connected",
    "530",
    "client is closed",
    "transfer strategies",
];

/// Message fragments that make a failure worth another queue attempt.
const TRANSIENT_SIGNATURES: &[&str] = &["timeout", "timed out", "reset", "socket", "connection"];

/// Top-level error type for remotesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure; retryable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server refused the connection because its client limit is reached.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// An operation or connect exceeded its deadline.
    #[error("Operation '{operation}' timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// No global connection slot became free in time.
    #[error("Timed out after {}s waiting for a connection slot", .0.as_secs())]
    SlotTimeout(Duration),

    /// A queued operation waited too long before starting.
    #[error("Operation '{label}' expired after waiting {}ms in queue", .waited.as_millis())]
    OperationExpired { label: String, waited: Duration },

    /// The operation queue is at capacity.
    #[error("Operation queue is full ({0} pending)")]
    QueueFull(usize),

    /// The operation was removed by a queue clear.
    #[error("Operation queue was cleared")]
    QueueCleared,

    /// Reconnection was attempted too many times.
    #[error("Maximum reconnect attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// Application-level failure reported by the remote side.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The component was stopped or disposed.
    #[error("Disposed: {0}")]
    Disposed(String),
}

impl Error {
    /// Build an error from a transport library message.
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            Error::RateLimited(message)
        } else if is_connection_message(&message) {
            Error::Connection(message)
        } else {
            Error::Remote(message)
        }
    }

    /// Build a timeout error for a labelled operation.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Server-side admission rejection (`530 ... maximum`).
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::Connection(msg) | Error::Remote(msg) => is_rate_limit_message(msg),
            _ => false,
        }
    }

    /// Failure that a reconnect may cure.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) | Error::RateLimited(_) | Error::Timeout { .. } => true,
            Error::Remote(msg) => is_connection_message(msg),
            Error::Io(err) => {
                use std::io::ErrorKind;
                matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::NotConnected
                        | ErrorKind::BrokenPipe
                        | ErrorKind::TimedOut
                        | ErrorKind::UnexpectedEof
                ) || is_connection_message(&err.to_string())
            }
            _ => false,
        }
    }

    /// Failure the operation queue should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Connection(_) | Error::RateLimited(_) => true,
            Error::OperationExpired { .. }
            | Error::QueueFull(_)
            | Error::QueueCleared
            | Error::MaxReconnectAttemptsExceeded(_)
            | Error::Disposed(_) => false,
            other => {
                let message = other.to_string().to_lowercase();
                TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// True when the message carries any connection-failure signature.
pub fn is_connection_message(message: &str) -> bool {
    let message = message.to_lowercase();
    CONNECTION_SIGNATURES.iter().any(|sig| message.contains(sig))
}

/// True when the message is a "too many connections" rejection.
pub fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("530") && message.contains("maximum")
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
