use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Direction, PaginationStatus, SendState};

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Cryptographic/encryption failure.
    Crypto,
    /// Storage/local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable failure payload reported by pagination and send transports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct TransportError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl TransportError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Network failure with the conventional `network_error` code.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "network_error", message)
    }

    /// Build an error from an HTTP status returned by the homeserver.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            classify_http_status(status),
            format!("http_{status}"),
            message,
        )
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// Errors returned to callers of `paginate_backwards`/`paginate_forwards`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    /// The pagination transport failed; the direction is now `Failed` and may be retried.
    #[error("pagination failed: {0}")]
    Transport(#[from] TransportError),
    /// A completion arrived for a direction that was not loading.
    #[error("cannot complete {direction:?} pagination while {status:?}")]
    InvalidTransition {
        direction: Direction,
        status: PaginationStatus,
    },
    /// The room timeline was torn down before the request resolved.
    #[error("room timeline is closed")]
    Closed,
}

/// Caller contract violations on the local echo tracker.
///
/// These are programming errors: they are logged and returned, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EchoError {
    #[error("transaction '{0}' is already tracked")]
    DuplicateTransaction(String),
    #[error("transaction '{0}' is not tracked")]
    UnknownTransaction(String),
    #[error("transaction '{transaction_id}' cannot {action} while {state:?}")]
    InvalidState {
        transaction_id: String,
        action: &'static str,
        state: SendState,
    },
}

/// Errors returned to callers of send/edit/redact/react/pin operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The send transport failed after all attempts; the echo is now `SendingFailed`.
    #[error("send failed: {0}")]
    Transport(TransportError),
    /// The send was cancelled before the transport call resolved.
    #[error("send was cancelled")]
    Cancelled,
    /// The referenced event is not loaded in this timeline.
    #[error("target event '{0}' is not in the timeline")]
    TargetNotFound(String),
    #[error(transparent)]
    Echo(#[from] EchoError),
    /// The room timeline was torn down before the request resolved.
    #[error("room timeline is closed")]
    Closed,
}

/// Failure to apply a redaction to the event store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedactionError {
    /// The target has not been seen yet; the redaction is parked until it arrives.
    #[error("redaction target '{0}' not found")]
    NotFound(String),
    #[error("event '{0}' is not a redaction")]
    NotARedaction(String),
}

/// Failure reported by the decryption layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    #[error("no keys for megolm session '{0}'")]
    MissingSession(String),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}
