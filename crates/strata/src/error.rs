//! Error types for Strata

use thiserror::Error;
use uuid::Uuid;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Durable storage errors (LanceDB, file system, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// The cache tier could not serve a request. Never surfaced by `get`/`put`.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The durable tier rejected or could not confirm a write
    #[error("Write error: {0}")]
    Write(String),

    /// The durable tier failed a read after a cache miss
    #[error("Read error: {0}")]
    Read(String),

    /// The durable tier failed a delete
    #[error("Delete error: {0}")]
    Delete(String),

    /// A durable tier call exceeded its per-call deadline
    #[error("Timeout: {operation} did not complete within {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The connection pool stayed saturated past its wait timeout
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No record with this id exists in the durable tier
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The record violates the data model (dimension, write-once fields)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Migration bookkeeping errors (checkpoints, provisioning, state)
    #[error("Migration error: {0}")]
    Migration(String),

    /// Source and target disagreed on too many sampled searches
    #[error("Migration validation failed: mismatch rate {mismatch_rate:.4} exceeds {tolerance:.4}")]
    MigrationValidationFailed { mismatch_rate: f64, tolerance: f64 },

    /// The cutover critical section did not finish in time
    #[error("Cutover did not complete within {0}s")]
    CutoverTimeout(u64),

    /// A rollback request could not be honored
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// A migration was cancelled cooperatively
    #[error("Migration cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StrataError {
    /// Whether a bounded retry may repeat the call that produced this error.
    ///
    /// Pool saturation is deliberately excluded: it is reported to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::Storage(_) | StrataError::Timeout { .. })
    }

    pub(crate) fn timeout(operation: &str, after_ms: u64) -> Self {
        StrataError::Timeout {
            operation: operation.to_string(),
            after_ms,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
