//! Error types for the document store.

use crate::types::Version;
use std::time::Duration;
use thiserror::Error;

/// Main error type for store operations.
///
/// `VersionConflict`, `RateLimited` and `Network` are recoverable and are
/// normally absorbed by the retry loop inside `update`. The remaining kinds
/// are terminal for the call that produced them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {path}: expected {expected:?}")]
    VersionConflict {
        path: String,
        expected: Option<Version>,
    },

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The outcome of the last write is unknown; re-read before concluding failure.
    #[error("Conflict retries exhausted on {path} after {attempts} attempts")]
    ConflictExhausted { path: String, attempts: u32 },

    /// The outcome of the last write is unknown; re-read before concluding failure.
    #[error("Deadline exceeded on {path} after {elapsed:?}")]
    TimeoutExceeded { path: String, elapsed: Duration },

    #[error("Update cancelled on {0}")]
    Cancelled(String),

    #[error("Write operations are disabled (attempted write to {0})")]
    WriteDisabled(String),

    #[error("Document is locked: {0}")]
    Locked(String),

    #[error("History changed during compaction: expected head {expected}, found {found}")]
    CompactionRaced { expected: String, found: String },

    #[error("Remote returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Whether the retry loop may absorb this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. }
                | StoreError::RateLimited { .. }
                | StoreError::Network(_)
        )
    }

    /// Whether a previously sent write may have landed despite this error.
    ///
    /// A write acknowledgement can be lost after the remote committed it, so
    /// callers seeing one of these must re-read the document.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            StoreError::ConflictExhausted { .. }
                | StoreError::TimeoutExceeded { .. }
                | StoreError::Cancelled(_)
                | StoreError::Network(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

impl From<base64::DecodeError> for StoreError {
    fn from(e: base64::DecodeError) -> Self {
        StoreError::InvalidFormat(format!("Invalid base64: {}", e))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Network(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
