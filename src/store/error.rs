//! Job store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from job store operations.
///
/// Lookups of unknown ids are not errors: they return `Ok(None)`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating the database directory.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}
