//! Persistent record store for the import pipeline.
//!
//! SQLite-backed tracking of every discovered file through upload and
//! processing verification. The store is the single source of truth: it
//! makes re-discovery idempotent, uploads resumable across runs, and
//! status reporting possible without touching the collaborators.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{RecordStore, SqliteRecordStore};
pub use error::StoreError;
pub use types::{
    DuplicateGroup, DuplicateMember, FileRecord, ImportResponse, ImportRunStats, NewFileRecord,
    ProcessingStatus, StoreSummary, UploadStatus, VerificationResponse,
};
