//! Claim record stored as the value of an election key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Who holds an election key and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Instance id of the holding process.
    pub holder: String,
    pub session_id: String,
    pub election: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn new(
        holder: impl Into<String>,
        session_id: impl Into<String>,
        election: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            holder: holder.into(),
            session_id: session_id.into(),
            election: election.into(),
            acquired_at: now,
            renewed_at: now,
        }
    }

    /// Copy with `renewed_at` moved to now.
    pub fn renewed(&self) -> Self {
        Self {
            renewed_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> CoordinationResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CoordinationError::Codec(format!("failed to encode claim record: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> CoordinationResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoordinationError::Codec(format!("failed to decode claim record: {e}")))
    }
}
