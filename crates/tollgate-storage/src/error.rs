//! Storage error types.

use thiserror::Error;

/// Failures surfaced by the ledger, package and card stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Creating the data directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A row written earlier in the same transaction could not be read back.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// No platform data directory to place the default database in.
    #[error("No data directory available: {0}")]
    DataDir(String),

    /// A thread panicked while holding the connection.
    #[error("Connection poisoned")]
    Poisoned,

    /// The file was written by a newer schema.
    #[error("Unsupported schema: {0}")]
    Migration(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
