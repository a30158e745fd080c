//! Error types for leader election.
//!
//! Callers need to tell apart a cancelled campaign, a misconfigured backend
//! and a backend that is temporarily unreachable. A lost session is not an
//! error: it is reported through [`Status`](crate::Status) and leadership
//! events only.

use thiserror::Error;

/// Top-level error type for the leader-election crate.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Missing or invalid coordination backend configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cancellation token was fired while the operation was pending.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The coordination backend could not be reached after retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A bounded operation did not finish before its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A claim record read from the backend could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ElectionError {
    /// Returns true if the operation stopped because its token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ElectionError::Cancelled(_))
    }

    /// Returns true if a later `campaign` or `resign` may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ElectionError::Unavailable(_) | ElectionError::Timeout(_)
        )
    }
}

/// Shorthand result alias for election operations.
pub type ElectionResult<T> = Result<T, ElectionError>;
