//! Error types for the Gizmo client core

use std::time::Duration;
use thiserror::Error;

/// Errors raised by executors, the connection manager and the bulk loader
#[derive(Error, Debug)]
pub enum GizmoError {
    /// Unknown connection name or unusable profile. Never involves the network.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connectivity probe failed while opening or switching an executor
    #[error("Connection error: {0}")]
    Connection(String),

    /// Non-retryable remote failure, or retry budget exhausted
    #[error("Remote execution error (retries {retries}): {message}")]
    RemoteExecution { message: String, retries: u32 },

    /// Cooperative cancellation observed mid-call
    #[error("Operation cancelled")]
    Cancelled,

    /// Back end signalled a rate limit. Retryable.
    #[error("Throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Transport fault such as an abrupt socket closure. Retryable.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed reply from the remote service
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Fault inside the client itself, such as a panicking executor task
    #[error("Internal error: {0}")]
    Internal(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GizmoResult<T> = Result<T, GizmoError>;

impl GizmoError {
    /// Build a non-retryable remote failure that has not been retried
    pub fn remote(message: impl Into<String>) -> Self {
        GizmoError::RemoteExecution {
            message: message.into(),
            retries: 0,
        }
    }

    /// Whether the retry policy may try the call again
    pub fn is_retryable(&self) -> bool {
        match self {
            GizmoError::Throttled { .. } | GizmoError::Transient(_) => true,
            GizmoError::Http(e) => e.is_connect() || e.is_timeout(),
            GizmoError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Server-advised wait carried by a throttling response
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GizmoError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convert a remote-side failure into the terminal error surfaced to callers.
    /// Configuration, connection and cancellation errors pass through unchanged.
    pub fn into_terminal(self, retries: u32) -> Self {
        match self {
            GizmoError::RemoteExecution { message, .. } => {
                GizmoError::RemoteExecution { message, retries }
            }
            e @ (GizmoError::Configuration(_) | GizmoError::Connection(_) | GizmoError::Cancelled) => e,
            e => GizmoError::RemoteExecution {
                message: e.to_string(),
                retries,
            },
        }
    }

    /// Retries recorded on a terminal remote failure
    pub fn retries(&self) -> u32 {
        match self {
            GizmoError::RemoteExecution { retries, .. } => *retries,
            _ => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GizmoError::Cancelled)
    }
}

impl From<crate::protocol::RespError> for GizmoError {
    fn from(err: crate::protocol::RespError) -> Self {
        match err {
            crate::protocol::RespError::Io(e) => GizmoError::Io(e),
            other => GizmoError::Protocol(other.to_string()),
        }
    }
}

pub(crate) fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut
    )
}
