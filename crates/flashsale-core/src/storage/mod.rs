//! Storage gateway: transactional access to items and reservations
//!
//! All stock-mutating work goes through a [`StorageTx`]: lock the item row,
//! apply a single column-relative delta, commit. The Postgres implementation
//! backs production; the in-memory implementation backs tests and standalone
//! runs with the same locking discipline.

pub mod gateway;
pub mod memory;
pub mod postgres;

pub use gateway::{StockDrift, StorageGateway, StorageTx};
pub use memory::MemoryGateway;
pub use postgres::{create_pool, PostgresDb, PostgresGateway};

/// Storage result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-specific error kinds surfaced to the engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("unique key collision: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Deadlock, lock timeout, serialization failure, pool exhaustion. The
    /// engine retries these with backoff.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Other(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut => {
                StorageError::Transient("connection pool timed out".to_string())
            }
            sqlx::Error::Io(e) => StorageError::Transient(format!("io: {}", e)),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation
                Some("23505") => StorageError::Conflict(
                    db.constraint().unwrap_or("unique constraint").to_string(),
                ),
                // foreign_key_violation, not_null_violation, check_violation
                Some("23503") | Some("23502") | Some("23514") => {
                    StorageError::Integrity(db.message().to_string())
                }
                // deadlock_detected, lock_not_available, serialization_failure
                Some("40P01") | Some("55P03") | Some("40001") => {
                    StorageError::Transient(db.message().to_string())
                }
                _ => StorageError::Other(db.message().to_string()),
            },
            _ => StorageError::Other(error.to_string()),
        }
    }
}

impl From<StorageError> for crate::Error {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(what) => crate::Error::NotFound(what),
            StorageError::Conflict(what) => crate::Error::Conflict(what),
            StorageError::Integrity(msg) => crate::Error::Internal(msg),
            StorageError::Transient(msg) => crate::Error::Transient(msg),
            StorageError::Other(msg) => crate::Error::Internal(msg),
        }
    }
}
