//! Types for the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upload-phase status of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Discovered but not yet uploaded.
    Pending,
    /// An upload worker has claimed the record.
    Uploading,
    /// Uploaded; a destination id is recorded.
    Completed,
    /// Upload failed terminally (retryable via requeue).
    Failed,
}

impl UploadStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Remote-processing status of an uploaded record. Absent until the upload
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Uploaded, remote processing not yet observed.
    Pending,
    /// Remote service reports the file is being processed.
    Processing,
    /// Remote processing finished successfully.
    Completed,
    /// Remote processing failed.
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further automatic transition occurs from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of the most recent upload attempt, preserved verbatim for
/// diagnostics. Stored as JSON in the `import_response` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportResponse {
    Success {
        destination_id: String,
        attempts: u32,
        last_attempt_at: DateTime<Utc>,
    },
    Failure {
        code: Option<u16>,
        message: String,
        attempts: u32,
        last_attempt_at: DateTime<Utc>,
    },
}

impl ImportResponse {
    /// Number of upload attempts made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }
}

/// Outcome of the most recent status poll, preserved verbatim for
/// diagnostics. Stored as JSON in the `verification_response` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationResponse {
    Status {
        remote_status: String,
        message: Option<String>,
        checked_at: DateTime<Utc>,
    },
    Error {
        code: Option<u16>,
        message: String,
        checked_at: DateTime<Utc>,
    },
}

/// One row per distinct source file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Identifier assigned by the source system. Unique, immutable.
    pub external_id: String,
    /// Filename at discovery time.
    pub name: String,
    /// Source URL the remote importer fetches from.
    pub url: String,
    /// Size in bytes, when the source reported one.
    pub size: Option<u64>,
    /// MIME type, when the source reported one.
    pub mime_type: Option<String>,
    /// Metadata fingerprint (size + normalized name + mime). Null when size
    /// or name was unknown at discovery.
    pub file_hash: Option<String>,
    /// External id of the earliest-discovered record sharing `file_hash`.
    /// Never set on the earliest member of a group.
    pub duplicate_of: Option<String>,
    /// Destination folder passed to the remote importer.
    pub destination_folder_id: Option<String>,
    /// Identifier assigned by the remote service. Write-once.
    pub destination_id: Option<String>,
    /// Most recent error message (upload or verification).
    pub last_error: Option<String>,
    /// Last upload outcome, including the attempt counter.
    pub import_response: Option<ImportResponse>,
    /// Last status-poll outcome.
    pub verification_response: Option<VerificationResponse>,
    pub discovered_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub upload_status: UploadStatus,
    pub processing_status: Option<ProcessingStatus>,
}

/// A newly discovered file, ready for insertion.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub file_hash: Option<String>,
    pub duplicate_of: Option<String>,
    pub destination_folder_id: Option<String>,
}

/// Statistics for a single import run.
#[derive(Debug, Clone, Default)]
pub struct ImportRunStats {
    pub files_discovered: u64,
    pub files_uploaded: u64,
    pub files_upload_failed: u64,
    pub files_verified: u64,
    pub files_verify_failed: u64,
    pub interrupted: bool,
}

/// Summary of the current store contents.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub total_files: u64,
    pub pending: u64,
    pub uploading: u64,
    pub uploaded: u64,
    pub upload_failed: u64,
    pub processing_completed: u64,
    pub processing_failed: u64,
    pub duplicates: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_completed: Option<DateTime<Utc>>,
}

/// One member of a duplicate group.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMember {
    pub external_id: String,
    pub name: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

/// A set of records sharing a fingerprint, size >= 2, ordered by discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub file_hash: String,
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_round_trip() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Completed,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(UploadStatus::from_str("bogus"), None);
    }

    #[test]
    fn processing_status_round_trip() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(ProcessingStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::from_str("bogus"), None);
    }

    #[test]
    fn processing_terminal_statuses() {
        assert!(!ProcessingStatus::Pending.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
        assert!(ProcessingStatus::Completed.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
    }

    #[test]
    fn import_response_json_round_trip() {
        let resp = ImportResponse::Failure {
            code: Some(503),
            message: "service unavailable".into(),
            attempts: 2,
            last_attempt_at: Utc::now(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"outcome\":\"failure\""));
        let back: ImportResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts(), 2);
        assert_eq!(back, resp);
    }

    #[test]
    fn verification_response_json_round_trip() {
        let resp = VerificationResponse::Status {
            remote_status: "processing".into(),
            message: None,
            checked_at: Utc::now(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: VerificationResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
