//! Registry error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from registry storage.
#[derive(Error, Debug)]
pub enum RegistryError {
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

    /// The connection lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Application '{0}' is not registered")]
    NotFound(String),

    #[error("Application '{0}' is already registered")]
    AlreadyExists(String),

    /// A stored JSON or enum column could not be decoded, or a value could not be encoded.
    #[error("Serialization error in column '{column}': {message}")]
    Serialization { column: String, message: String },
}

impl RegistryError {
    pub(crate) fn serialization(column: &str, message: impl ToString) -> Self {
        RegistryError::Serialization {
            column: column.to_string(),
            message: message.to_string(),
        }
    }
}
