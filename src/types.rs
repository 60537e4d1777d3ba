use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What to do with a file whose metadata fingerprint matches an
/// earlier-discovered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
pub enum DuplicateStrategy {
    /// Flag the duplicate and exclude it from upload.
    Skip,
    /// Flag the duplicate but upload it anyway.
    Upload,
    /// Flag the duplicate and upload it in place of the earlier record.
    /// The prior destination artifact is left untouched; this tool never
    /// deletes anything on the remote side.
    Replace,
}

impl DuplicateStrategy {
    /// Whether records flagged as duplicates stay eligible for upload.
    pub fn uploads_duplicates(&self) -> bool {
        !matches!(self, DuplicateStrategy::Skip)
    }
}

/// Output format for the status and duplicates commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_excludes_duplicates_from_upload() {
        assert!(!DuplicateStrategy::Skip.uploads_duplicates());
        assert!(DuplicateStrategy::Upload.uploads_duplicates());
        assert!(DuplicateStrategy::Replace.uploads_duplicates());
    }
}
