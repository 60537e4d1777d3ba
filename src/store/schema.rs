//! Database schema definitions and migrations.

use rusqlite::Connection;

use super::error::StoreError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
///
/// `files` is keyed by a surrogate rowid; `external_id` carries the UNIQUE
/// constraint that makes re-discovery idempotent. The composite hash index
/// covers duplicate lookups in discovery order without a sort step.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    size INTEGER,
    mime_type TEXT,
    file_hash TEXT,
    duplicate_of TEXT,
    destination_folder_id TEXT,
    destination_id TEXT,
    upload_status TEXT NOT NULL DEFAULT 'pending',
    processing_status TEXT,
    last_error TEXT,
    import_response TEXT,
    verification_response TEXT,
    discovered_at INTEGER NOT NULL,
    uploaded_at INTEGER,
    completed_at INTEGER,
    last_checked_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_files_hash_discovered ON files(file_hash, discovered_at, id);
CREATE INDEX IF NOT EXISTS idx_files_upload_status ON files(upload_status);
CREATE INDEX IF NOT EXISTS idx_files_processing_status ON files(processing_status);

CREATE TABLE IF NOT EXISTS import_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    files_discovered INTEGER DEFAULT 0,
    files_uploaded INTEGER DEFAULT 0,
    files_upload_failed INTEGER DEFAULT 0,
    files_verified INTEGER DEFAULT 0,
    files_verify_failed INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent; safe to call on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

/// Apply migration for a specific version.
fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    // Future migrations go here, e.g.:
    // match version {
    //     2 => { conn.execute_batch("ALTER TABLE files ADD COLUMN new_field TEXT")?; }
    //     _ => {}
    // }
    if version != SCHEMA_VERSION {
        tracing::warn!("Unexpected schema version {}, applying base schema", version);
    }
    conn.execute_batch(SCHEMA_V1)?;
    set_schema_version(conn, version)?;
    tracing::info!("Migrated database to schema version {}", version);
    Ok(())
}
