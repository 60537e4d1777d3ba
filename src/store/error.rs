//! Error types for the record store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during record store operations. Any of these is
/// fatal to the running phase; callers surface it rather than retrying.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// A stored response payload could not be decoded.
    #[error("Corrupt response payload for record {external_id}: {source}")]
    Payload {
        external_id: String,
        source: serde_json::Error,
    },

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StoreError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
