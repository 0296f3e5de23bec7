//! Unified error handling for the sync engine.
//!
//! Internal layers propagate `SyncError` with `?`; the UI boundary never
//! sees it. Every public session operation resolves to an [`Outcome`]
//! (ok/failed plus a human-readable message) so the caller can surface a
//! toast without a try/catch of its own.

use thiserror::Error;

/// Errors raised by the remote document store seam.
///
/// `Unavailable` covers everything that behaves like "offline": the
/// network layer is suspended, the transport failed, or the store's
/// client threw before a response landed. The engine treats it as a
/// routing decision, not a failure.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Remote store could not be reached (offline, suspended, transport error)
    #[error("remote store unavailable: {message}")]
    Unavailable { message: String },
    /// Remote store answered with a non-success status
    #[error("remote store rejected request (HTTP {status}): {message}")]
    Http { status: u16, message: String },
    /// Document does not exist remotely
    #[error("remote document '{0}' not found")]
    NotFound(String),
    /// Payload could not be encoded or the response could not be decoded
    #[error("remote payload error: {0}")]
    Payload(String),
}

impl RemoteError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        RemoteError::Unavailable {
            message: message.into(),
        }
    }
}

/// Unified error type for sync-engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Input rejected before any state change
    #[error("validation failed: {0}")]
    Validation(String),
    /// Local durable store write failed
    #[error("local storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// Local payload could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Remote store operation failed
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Operation requires an in-flight session and none is loaded
    #[error("no active session")]
    NoActiveSession,
    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for sync-engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Non-throwing status outcome returned by every UI-facing operation.
///
/// `ok == false` means the operation was rejected or failed locally; the
/// message is suitable for toast-style display either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Outcome {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Outcome {
            ok: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Validation("title is empty".to_string());
        assert!(err.to_string().contains("title is empty"));

        let err = RemoteError::Http {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(Outcome::ok("done").ok);
        assert!(!Outcome::failed("nope").ok);
    }
}
