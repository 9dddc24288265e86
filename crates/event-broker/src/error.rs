//! # Broker Errors
//!
//! One error type shared by every backend. Transport client errors are
//! flattened into [`BrokerError::Connection`] or [`BrokerError::Transport`]
//! so callers never depend on a particular client library.

use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker was closed; no further publish or subscribe is accepted.
    #[error("broker is closed")]
    Closed,

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload could not be decoded into the requested shape.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The pattern or event name cannot be expressed by the backend.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Invalid or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport rejected or failed an operation.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap any transport client error.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Wrap a connection-phase error.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    /// Whether the error came from the caller's context rather than the broker.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
