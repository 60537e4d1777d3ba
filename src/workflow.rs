//! Full-pipeline sequencer: discovery, upload, verification, in that order.
//!
//! Each phase commits its effects to the store as it goes, so an error or a
//! shutdown between phases loses nothing; the next run resumes from the
//! recorded state. Run-level statistics land in the `import_runs` table.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::discover::{run_discovery, DiscoverOptions, DiscoverySummary};
use crate::ratelimit::RateLimiter;
use crate::remote::RemoteImporter;
use crate::source::SourceLister;
use crate::store::{ImportRunStats, RecordStore, StoreError};
use crate::upload::{run_upload, UploadOptions, UploadSummary};
use crate::verify::{run_verify, VerifyOptions, VerifySummary};

/// Unrecoverable pipeline failure. Everything committed before the failure
/// stays committed.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("State store failure: {0}")]
    Store(#[from] StoreError),
}

/// Options for a full pipeline run.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub discover: DiscoverOptions,
    pub upload: UploadOptions,
    pub verify: VerifyOptions,
}

/// Per-phase summaries for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub discovery: DiscoverySummary,
    pub upload: UploadSummary,
    /// None when the run was cut short (shutdown or dry run).
    pub verify: Option<VerifySummary>,
}

impl RunReport {
    fn stats(&self) -> ImportRunStats {
        ImportRunStats {
            files_discovered: self.discovery.inserted,
            files_uploaded: self.upload.uploaded,
            files_upload_failed: self.upload.failed,
            files_verified: self.verify.as_ref().map(|v| v.completed).unwrap_or(0),
            files_verify_failed: self.verify.as_ref().map(|v| v.failed).unwrap_or(0),
            interrupted: self.discovery.interrupted
                || self.upload.interrupted
                || self.verify.as_ref().is_some_and(|v| v.interrupted),
        }
    }
}

/// Run the full pipeline.
///
/// A dry run performs discovery (local writes only), previews the upload
/// queue, and skips verification and run bookkeeping.
pub async fn run_pipeline(
    store: Arc<dyn RecordStore>,
    lister: &dyn SourceLister,
    importer: Arc<dyn RemoteImporter>,
    limiter: Arc<RateLimiter>,
    options: &WorkflowOptions,
    shutdown: CancellationToken,
) -> Result<RunReport, WorkflowError> {
    let dry_run = options.upload.dry_run;
    let run_id = if dry_run {
        None
    } else {
        Some(store.start_run().await?)
    };

    let discovery = run_discovery(
        store.clone(),
        lister,
        &options.discover,
        shutdown.clone(),
    )
    .await;

    if shutdown.is_cancelled() {
        let report = RunReport {
            discovery,
            upload: UploadSummary {
                interrupted: true,
                ..Default::default()
            },
            verify: None,
        };
        finish_run(store.as_ref(), run_id, &report).await;
        return Ok(report);
    }

    let upload = match run_upload(
        store.clone(),
        importer.clone(),
        limiter.clone(),
        &options.upload,
        shutdown.clone(),
    )
    .await
    {
        Ok(upload) => upload,
        Err(e) => {
            let report = RunReport {
                discovery,
                upload: UploadSummary {
                    interrupted: true,
                    ..Default::default()
                },
                verify: None,
            };
            finish_run(store.as_ref(), run_id, &report).await;
            return Err(e.into());
        }
    };

    let verify = if dry_run || shutdown.is_cancelled() {
        None
    } else {
        Some(
            run_verify(
                store.clone(),
                importer,
                limiter,
                &options.verify,
                shutdown.clone(),
            )
            .await?,
        )
    };

    let report = RunReport {
        discovery,
        upload,
        verify,
    };
    finish_run(store.as_ref(), run_id, &report).await;
    Ok(report)
}

async fn finish_run(store: &dyn RecordStore, run_id: Option<i64>, report: &RunReport) {
    if let Some(run_id) = run_id {
        if let Err(e) = store.complete_run(run_id, &report.stats()).await {
            tracing::warn!("Failed to record run statistics: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedImporter;
    use crate::remote::{RemoteStatus, UploadReceipt};
    use crate::source::testing::{file, StaticLister};
    use crate::store::{ProcessingStatus, SqliteRecordStore, UploadStatus};
    use crate::types::DuplicateStrategy;
    use std::time::Duration;

    fn options() -> WorkflowOptions {
        WorkflowOptions {
            discover: DiscoverOptions {
                container: "root".to_string(),
                recursive: false,
                max_items: None,
                destination_folder_id: None,
            },
            upload: UploadOptions {
                concurrency: 2,
                duplicate_strategy: DuplicateStrategy::Skip,
                include_failed: true,
                retry: crate::retry::RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                },
                dry_run: false,
                no_progress_bar: true,
            },
            verify: VerifyOptions {
                poll_interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
                batch_size: 50,
            },
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Duration::ZERO))
    }

    #[tokio::test]
    async fn pipeline_runs_all_three_phases() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let lister = StaticLister::new(vec![
            file("A", "a.pdf", Some(1), None),
            file("B", "b.pdf", Some(2), None),
        ]);

        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload(
            "https://source.example/files/A",
            vec![Ok(UploadReceipt {
                destination_id: "dest-A".to_string(),
            })],
        );
        importer.script_upload(
            "https://source.example/files/B",
            vec![Ok(UploadReceipt {
                destination_id: "dest-B".to_string(),
            })],
        );
        importer.script_status(
            "dest-A",
            vec![Ok(RemoteStatus {
                status: "completed".to_string(),
                message: None,
            })],
        );
        importer.script_status(
            "dest-B",
            vec![
                Ok(RemoteStatus {
                    status: "processing".to_string(),
                    message: None,
                }),
                Ok(RemoteStatus {
                    status: "completed".to_string(),
                    message: None,
                }),
            ],
        );

        let report = run_pipeline(
            store.clone(),
            &lister,
            importer,
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.discovery.inserted, 2);
        assert_eq!(report.upload.uploaded, 2);
        assert_eq!(report.verify.as_ref().unwrap().completed, 2);

        let rec = store.get("A").await.unwrap().unwrap();
        assert_eq!(rec.upload_status, UploadStatus::Completed);
        assert_eq!(rec.processing_status, Some(ProcessingStatus::Completed));

        // Run bookkeeping was recorded
        let summary = store.get_summary().await.unwrap();
        assert!(summary.last_run_started.is_some());
        assert!(summary.last_run_completed.is_some());
    }

    #[tokio::test]
    async fn pipeline_is_idempotent_across_runs() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let lister = StaticLister::new(vec![file("A", "a.pdf", Some(1), None)]);

        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload(
            "https://source.example/files/A",
            vec![Ok(UploadReceipt {
                destination_id: "dest-A".to_string(),
            })],
        );
        importer.script_status(
            "dest-A",
            vec![Ok(RemoteStatus {
                status: "completed".to_string(),
                message: None,
            })],
        );

        let first = run_pipeline(
            store.clone(),
            &lister,
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(first.upload.uploaded, 1);

        let second = run_pipeline(
            store.clone(),
            &lister,
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(second.discovery.already_known, 1);
        assert_eq!(second.upload.uploaded, 0);
        assert_eq!(second.verify.as_ref().unwrap().polls, 0);

        // Exactly one upload call across both runs
        assert_eq!(importer.upload_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_previews_without_side_effects() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let lister = StaticLister::new(vec![file("A", "a.pdf", Some(1), None)]);
        let importer = Arc::new(ScriptedImporter::new());

        let mut opts = options();
        opts.upload.dry_run = true;
        let report = run_pipeline(
            store.clone(),
            &lister,
            importer.clone(),
            limiter(),
            &opts,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.upload.queued, 1);
        assert_eq!(report.upload.uploaded, 0);
        assert!(report.verify.is_none());
        assert!(importer.upload_calls.lock().unwrap().is_empty());

        // Discovery is recorded even on a dry run, but no run row is written
        assert_eq!(
            store.get("A").await.unwrap().unwrap().upload_status,
            UploadStatus::Pending
        );
        assert!(store.get_summary().await.unwrap().last_run_started.is_none());
    }

    #[tokio::test]
    async fn upload_failure_does_not_block_the_rest() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let lister = StaticLister::new(vec![
            file("A", "a.pdf", Some(1), None),
            file("B", "b.pdf", Some(2), None),
        ]);

        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload(
            "https://source.example/files/A",
            vec![Err(crate::remote::RemoteError::Status {
                status: 422,
                message: "unprocessable".to_string(),
            })],
        );
        importer.script_upload(
            "https://source.example/files/B",
            vec![Ok(UploadReceipt {
                destination_id: "dest-B".to_string(),
            })],
        );
        importer.script_status(
            "dest-B",
            vec![Ok(RemoteStatus {
                status: "completed".to_string(),
                message: None,
            })],
        );

        let report = run_pipeline(
            store.clone(),
            &lister,
            importer,
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.upload.uploaded, 1);
        assert_eq!(report.upload.failed, 1);
        assert_eq!(report.verify.as_ref().unwrap().completed, 1);
        assert_eq!(
            store.get("A").await.unwrap().unwrap().upload_status,
            UploadStatus::Failed
        );
    }
}
