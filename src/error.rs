//! Error taxonomy for the storage engine.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Errors surfaced by storage, queue and transaction operations.
///
/// Lost races (a claim or acknowledge affecting zero rows) are not errors
/// and never show up here.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bad configuration, surfaced at construction.
    #[error("Invalid storage configuration: {0}")]
    Validation(#[from] ConfigError),

    /// The writer lock was not acquired in time. Callers may retry.
    #[error("Timed out after {timeout:?} waiting for the write lock on {database}")]
    LockTimeout { database: String, timeout: Duration },

    #[error("Failed to obtain a database connection: {0}")]
    Connection(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The shared connection mutex was poisoned by a panicking holder.
    #[error("Shared connection poisoned during {operation}")]
    Poisoned { operation: &'static str },
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::Connection(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Option validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connection string must not be empty")]
    EmptyConnectionString,

    #[error("schema name must not be blank")]
    BlankSchemaName,

    #[error("schema name {0:?} must not contain quotes")]
    InvalidSchemaName(String),

    #[error("{name} should be positive, given: {value:?}")]
    NonPositive { name: &'static str, value: Duration },

    #[error("dashboard job list limit should be positive")]
    ZeroListLimit,
}
