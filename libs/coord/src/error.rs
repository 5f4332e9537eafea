//! Error types for coordination-store operations.

use thiserror::Error;

/// Errors surfaced by a [`CoordStore`](crate::CoordStore).
#[derive(Debug, Error, Clone)]
pub enum CoordError {
    /// The store could not be reached or did not answer in time.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something other than the expected success or
    /// not-found/already-exists shapes.
    #[error("coordination store request failed (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<u64>,
        message: String,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoordError {
    /// Whether the caller should treat this as a transient condition and
    /// simply retry on its next pass. Store unavailability and unexpected
    /// store responses are transient; a serialization failure is not, since
    /// it means this process is producing records the fleet cannot agree on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Api { .. })
    }
}

impl From<reqwest::Error> for CoordError {
    fn from(err: reqwest::Error) -> Self {
        CoordError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}
