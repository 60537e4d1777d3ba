//! Record store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StoreError;
use super::schema;
use super::types::{
    DuplicateGroup, DuplicateMember, FileRecord, ImportResponse, ImportRunStats, NewFileRecord,
    ProcessingStatus, StoreSummary, UploadStatus, VerificationResponse,
};

/// Trait for record store operations.
///
/// Object-safe so orchestrators can share an `Arc<dyn RecordStore>`. Every
/// mutating method is a single read-modify-write against one record's row;
/// concurrent upload workers never interleave on the same row.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a newly discovered file with `upload_status=pending`.
    ///
    /// Inserting an `external_id` that already exists is a no-op that
    /// preserves the original row. Returns true if a row was inserted.
    async fn insert_discovered(&self, record: &NewFileRecord) -> Result<bool, StoreError>;

    /// Fetch a single record by external id.
    async fn get(&self, external_id: &str) -> Result<Option<FileRecord>, StoreError>;

    /// All records, in discovery order.
    async fn get_all(&self) -> Result<Vec<FileRecord>, StoreError>;

    /// Records eligible for upload, in discovery order (the upload FIFO).
    ///
    /// Eligible means `upload_status != completed`; when `include_duplicates`
    /// is false, records flagged `duplicate_of` are excluded; when
    /// `include_failed` is false, failed records are excluded.
    async fn get_uploadable(
        &self,
        include_duplicates: bool,
        include_failed: bool,
    ) -> Result<Vec<FileRecord>, StoreError>;

    /// Atomically move a record to `uploading` for this worker.
    ///
    /// Returns false if the record is already completed (another worker or a
    /// prior run got there first).
    async fn claim_for_upload(&self, external_id: &str) -> Result<bool, StoreError>;

    /// Record a successful upload: `upload_status=completed`,
    /// `processing_status=pending`, `uploaded_at=now`. The destination id is
    /// write-once — an already-set value is never overwritten.
    async fn mark_uploaded(
        &self,
        external_id: &str,
        destination_id: &str,
        response: &ImportResponse,
    ) -> Result<(), StoreError>;

    /// Record a retryable failure and return the record to the pending set
    /// so a re-enqueue (or a later run) picks it up.
    async fn mark_upload_retrying(
        &self,
        external_id: &str,
        response: &ImportResponse,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Record a terminal upload failure.
    async fn mark_upload_failed(
        &self,
        external_id: &str,
        response: &ImportResponse,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Records awaiting verification: destination id present, processing
    /// status non-terminal. Discovery order.
    async fn get_verifiable(&self) -> Result<Vec<FileRecord>, StoreError>;

    /// Record the outcome of a status poll, updating `processing_status`,
    /// `verification_response`, and `last_checked_at`. Sets `completed_at`
    /// the first time the record reaches `completed`.
    async fn record_verification(
        &self,
        external_id: &str,
        status: ProcessingStatus,
        response: &VerificationResponse,
    ) -> Result<(), StoreError>;

    /// Record a status-poll error without changing the processing status.
    async fn record_verification_error(
        &self,
        external_id: &str,
        response: &VerificationResponse,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Return all failed-upload records to pending with a fresh attempt
    /// budget, preserving their original `discovered_at`. Returns the number
    /// of records requeued.
    async fn requeue_failed(&self) -> Result<u64, StoreError>;

    /// All records with a failed upload.
    async fn get_failed(&self) -> Result<Vec<FileRecord>, StoreError>;

    /// Earliest-discovered record sharing `file_hash`, excluding the given
    /// external id. Ties broken by insertion order.
    async fn find_duplicate_of(
        &self,
        file_hash: &str,
        excluding_external_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// All fingerprint groups with at least two members, largest first.
    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError>;

    /// Counts per status for reporting.
    async fn get_summary(&self) -> Result<StoreSummary, StoreError>;

    /// Start a new import run and return its id.
    async fn start_run(&self) -> Result<i64, StoreError>;

    /// Complete an import run with statistics.
    async fn complete_run(&self, run_id: i64, stats: &ImportRunStats) -> Result<(), StoreError>;
}

/// SQLite implementation of the record store.
pub struct SqliteRecordStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL for concurrent read/write; NORMAL is safe under WAL.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Query(e.to_string()))??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

const RECORD_COLUMNS: &str = "external_id, name, url, size, mime_type, file_hash, duplicate_of, \
     destination_folder_id, destination_id, upload_status, processing_status, last_error, \
     import_response, verification_response, discovered_at, uploaded_at, completed_at, \
     last_checked_at";

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_discovered(&self, record: &NewFileRecord) -> Result<bool, StoreError> {
        let discovered_at = Utc::now().timestamp();
        let conn = self.lock()?;

        // INSERT OR IGNORE makes re-discovery idempotent: the UNIQUE
        // constraint on external_id preserves the original row untouched.
        let rows = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO files
                    (external_id, name, url, size, mime_type, file_hash, duplicate_of,
                     destination_folder_id, upload_status, discovered_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)
                "#,
                rusqlite::params![
                    record.external_id,
                    record.name,
                    record.url,
                    record.size.map(|s| s as i64),
                    record.mime_type,
                    record.file_hash,
                    record.duplicate_of,
                    record.destination_folder_id,
                    discovered_at,
                ],
            )
            .map_err(StoreError::query)?;

        Ok(rows == 1)
    }

    async fn get(&self, external_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM files WHERE external_id = ?1"),
            [external_id],
            row_to_file_record,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn get_all(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM files ORDER BY discovered_at, id"
            ))
            .map_err(StoreError::query)?;
        let records = stmt
            .query_map([], row_to_file_record)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;
        Ok(records)
    }

    async fn get_uploadable(
        &self,
        include_duplicates: bool,
        include_failed: bool,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE upload_status != 'completed'"
        );
        if !include_duplicates {
            sql.push_str(" AND duplicate_of IS NULL");
        }
        if !include_failed {
            sql.push_str(" AND upload_status != 'failed'");
        }
        sql.push_str(" ORDER BY discovered_at, id");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(StoreError::query)?;
        let records = stmt
            .query_map([], row_to_file_record)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;
        Ok(records)
    }

    async fn claim_for_upload(&self, external_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE files SET upload_status = 'uploading'
                 WHERE external_id = ?1 AND upload_status != 'completed'",
                [external_id],
            )
            .map_err(StoreError::query)?;
        Ok(rows == 1)
    }

    async fn mark_uploaded(
        &self,
        external_id: &str,
        destination_id: &str,
        response: &ImportResponse,
    ) -> Result<(), StoreError> {
        let uploaded_at = Utc::now().timestamp();
        let payload = encode_payload(external_id, response)?;
        let conn = self.lock()?;

        // COALESCE keeps an already-assigned destination id: write-once.
        conn.execute(
            "UPDATE files SET
                 upload_status = 'completed',
                 destination_id = COALESCE(destination_id, ?1),
                 processing_status = COALESCE(processing_status, 'pending'),
                 uploaded_at = ?2,
                 import_response = ?3,
                 last_error = NULL
             WHERE external_id = ?4",
            rusqlite::params![destination_id, uploaded_at, payload, external_id],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn mark_upload_retrying(
        &self,
        external_id: &str,
        response: &ImportResponse,
        error: &str,
    ) -> Result<(), StoreError> {
        let payload = encode_payload(external_id, response)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET upload_status = 'pending', import_response = ?1, last_error = ?2
             WHERE external_id = ?3 AND upload_status != 'completed'",
            rusqlite::params![payload, error, external_id],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn mark_upload_failed(
        &self,
        external_id: &str,
        response: &ImportResponse,
        error: &str,
    ) -> Result<(), StoreError> {
        let payload = encode_payload(external_id, response)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET upload_status = 'failed', import_response = ?1, last_error = ?2
             WHERE external_id = ?3 AND upload_status != 'completed'",
            rusqlite::params![payload, error, external_id],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn get_verifiable(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM files
                 WHERE destination_id IS NOT NULL
                   AND (processing_status IS NULL
                        OR processing_status NOT IN ('completed', 'failed'))
                 ORDER BY discovered_at, id"
            ))
            .map_err(StoreError::query)?;
        let records = stmt
            .query_map([], row_to_file_record)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;
        Ok(records)
    }

    async fn record_verification(
        &self,
        external_id: &str,
        status: ProcessingStatus,
        response: &VerificationResponse,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let payload = encode_payload(external_id, response)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET
                 processing_status = ?1,
                 verification_response = ?2,
                 last_checked_at = ?3,
                 completed_at = CASE WHEN ?1 = 'completed'
                                     THEN COALESCE(completed_at, ?3)
                                     ELSE completed_at END
             WHERE external_id = ?4",
            rusqlite::params![status.as_str(), payload, now, external_id],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn record_verification_error(
        &self,
        external_id: &str,
        response: &VerificationResponse,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let payload = encode_payload(external_id, response)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET verification_response = ?1, last_checked_at = ?2, last_error = ?3
             WHERE external_id = ?4",
            rusqlite::params![payload, now, error, external_id],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn requeue_failed(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE files SET upload_status = 'pending', last_error = NULL,
                        import_response = NULL
                 WHERE upload_status = 'failed'",
                [],
            )
            .map_err(StoreError::query)?;
        Ok(rows as u64)
    }

    async fn get_failed(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM files WHERE upload_status = 'failed'
                 ORDER BY discovered_at, id"
            ))
            .map_err(StoreError::query)?;
        let records = stmt
            .query_map([], row_to_file_record)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;
        Ok(records)
    }

    async fn find_duplicate_of(
        &self,
        file_hash: &str,
        excluding_external_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT external_id FROM files
             WHERE file_hash = ?1 AND external_id != ?2
             ORDER BY discovered_at, id LIMIT 1",
            [file_hash, excluding_external_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        let conn = self.lock()?;

        let mut groups_stmt = conn
            .prepare(
                "SELECT file_hash, COUNT(*) AS members FROM files
                 WHERE file_hash IS NOT NULL
                 GROUP BY file_hash HAVING COUNT(*) >= 2
                 ORDER BY members DESC, file_hash",
            )
            .map_err(StoreError::query)?;
        let hashes: Vec<String> = groups_stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        let mut members_stmt = conn
            .prepare(
                "SELECT external_id, name, size, mime_type FROM files
                 WHERE file_hash = ?1 ORDER BY discovered_at, id",
            )
            .map_err(StoreError::query)?;

        let mut groups = Vec::with_capacity(hashes.len());
        for file_hash in hashes {
            let members = members_stmt
                .query_map([&file_hash], |row| {
                    Ok(DuplicateMember {
                        external_id: row.get(0)?,
                        name: row.get(1)?,
                        size: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
                        mime_type: row.get(3)?,
                    })
                })
                .map_err(StoreError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::query)?;
            groups.push(DuplicateGroup { file_hash, members });
        }

        Ok(groups)
    }

    async fn get_summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.lock()?;

        let count = |sql: &str| -> Result<u64, StoreError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(StoreError::query)
        };

        let total_files = count("SELECT COUNT(*) FROM files")?;
        let pending = count("SELECT COUNT(*) FROM files WHERE upload_status = 'pending'")?;
        let uploading = count("SELECT COUNT(*) FROM files WHERE upload_status = 'uploading'")?;
        let uploaded = count("SELECT COUNT(*) FROM files WHERE upload_status = 'completed'")?;
        let upload_failed = count("SELECT COUNT(*) FROM files WHERE upload_status = 'failed'")?;
        let processing_completed =
            count("SELECT COUNT(*) FROM files WHERE processing_status = 'completed'")?;
        let processing_failed =
            count("SELECT COUNT(*) FROM files WHERE processing_status = 'failed'")?;
        let duplicates = count("SELECT COUNT(*) FROM files WHERE duplicate_of IS NOT NULL")?;

        let last_run: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM import_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::query)?;

        let (last_run_started, last_run_completed) = match last_run {
            Some((started, completed)) => (
                started.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            ),
            None => (None, None),
        };

        Ok(StoreSummary {
            total_files,
            pending,
            uploading,
            uploaded,
            upload_failed,
            processing_completed,
            processing_failed,
            duplicates,
            last_run_started,
            last_run_completed,
        })
    }

    async fn start_run(&self) -> Result<i64, StoreError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO import_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(StoreError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &ImportRunStats) -> Result<(), StoreError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE import_runs SET
                 completed_at = ?1,
                 files_discovered = ?2,
                 files_uploaded = ?3,
                 files_upload_failed = ?4,
                 files_verified = ?5,
                 files_verify_failed = ?6,
                 interrupted = ?7
             WHERE id = ?8",
            rusqlite::params![
                completed_at,
                stats.files_discovered as i64,
                stats.files_uploaded as i64,
                stats.files_upload_failed as i64,
                stats.files_verified as i64,
                stats.files_verify_failed as i64,
                stats.interrupted as i64,
                run_id,
            ],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }
}

fn encode_payload<T: serde::Serialize>(
    external_id: &str,
    payload: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(payload).map_err(|e| StoreError::Payload {
        external_id: external_id.to_string(),
        source: e,
    })
}

/// Column could not be interpreted; surfaces as a conversion error so the
/// caller sees a store failure instead of a fabricated record.
fn column_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

/// Convert a database row to a FileRecord.
///
/// Structural columns (identity, URLs, statuses, timestamps) are strict: a
/// row that cannot be read faithfully is an error, never a default record —
/// a corrupt `upload_status` coerced to pending would silently re-queue the
/// file. Stored JSON payloads stay lenient: an undecodable payload is
/// dropped with a warning, since it is diagnostic data only.
fn row_to_file_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let external_id: String = row.get(0)?;
    let import_response: Option<ImportResponse> = decode_payload(row, 12, &external_id);
    let verification_response: Option<VerificationResponse> = decode_payload(row, 13, &external_id);

    let upload_status_raw: String = row.get(9)?;
    let upload_status = UploadStatus::from_str(&upload_status_raw).ok_or_else(|| {
        column_error(9, format!("unknown upload status '{upload_status_raw}'"))
    })?;
    let processing_status = match row.get::<_, Option<String>>(10)? {
        Some(raw) => Some(ProcessingStatus::from_str(&raw).ok_or_else(|| {
            column_error(10, format!("unknown processing status '{raw}'"))
        })?),
        None => None,
    };

    let discovered_at_raw: i64 = row.get(14)?;
    let discovered_at = Utc
        .timestamp_opt(discovered_at_raw, 0)
        .single()
        .ok_or_else(|| column_error(14, format!("invalid timestamp {discovered_at_raw}")))?;

    Ok(FileRecord {
        name: row.get(1)?,
        url: row.get(2)?,
        size: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
        mime_type: row.get(4)?,
        file_hash: row.get(5)?,
        duplicate_of: row.get(6)?,
        destination_folder_id: row.get(7)?,
        destination_id: row.get(8)?,
        upload_status,
        processing_status,
        last_error: row.get(11)?,
        import_response,
        verification_response,
        discovered_at,
        uploaded_at: optional_timestamp(row, 15)?,
        completed_at: optional_timestamp(row, 16)?,
        last_checked_at: optional_timestamp(row, 17)?,
        external_id,
    })
}

fn optional_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ts) => Utc
            .timestamp_opt(ts, 0)
            .single()
            .map(Some)
            .ok_or_else(|| column_error(idx, format!("invalid timestamp {ts}"))),
        None => Ok(None),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    external_id: &str,
) -> Option<T> {
    let raw: Option<String> = row.get(idx).ok().flatten();
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(external_id, "Dropping undecodable response payload: {}", e);
            None
        }
    }
}
