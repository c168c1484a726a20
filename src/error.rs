//! Error types for the crypto store.

use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Lookups for records that simply do not exist are not errors; those
/// operations return `Ok(None)` (or an empty collection) instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized for storage.
    ///
    /// The message never contains the record contents.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Legacy-store migration failed; the legacy data is left in place.
    #[error("migration failed: {0}")]
    Migration(String),
}
