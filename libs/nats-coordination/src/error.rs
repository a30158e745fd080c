//! Error types for NATS coordination operations.
//!
//! Typed variants keep transport failures, timeouts and revision conflicts
//! apart without leaking async-nats error kinds to the election layer.

use leader_election::ElectionError;
use thiserror::Error;

/// Top-level error type for the nats-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// NATS connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for a response.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The claim key moved past the revision this session last wrote.
    #[error("revision conflict on '{key}': expected revision {expected}")]
    RevisionConflict { key: String, expected: u64 },

    /// Maximum retry attempts exhausted for a failing operation.
    #[error("max retries exhausted after {attempts} attempts: {last}")]
    MaxRetriesExhausted { attempts: u32, last: String },

    /// Codec error during serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. missing required fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client is not connected or connection was lost.
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_) | CoordinationError::Timeout(_)
        )
    }

    /// Returns true if this error is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordinationError::RevisionConflict { .. })
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }
}

impl From<CoordinationError> for ElectionError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Config(msg) => ElectionError::Config(msg),
            CoordinationError::Codec(msg) => ElectionError::Codec(msg),
            CoordinationError::Timeout(msg) => ElectionError::Timeout(msg),
            err @ (CoordinationError::Transport(_)
            | CoordinationError::RevisionConflict { .. }
            | CoordinationError::MaxRetriesExhausted { .. }
            | CoordinationError::NotConnected(_)) => ElectionError::Unavailable(err.to_string()),
        }
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
