//! Upload phase — submits pending records to the remote importer.
//!
//! Workers pull from a shared FIFO queue seeded in discovery order. A
//! transient failure never blocks a worker: the record is returned to
//! `pending` in the store and a scheduler task re-enqueues it after the
//! backoff delay, so the worker moves straight on to the next record.
//! The queue closes once every enqueued record has reached an outcome.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;
use crate::remote::RemoteImporter;
use crate::retry::{RetryAction, RetryPolicy};
use crate::store::{ImportResponse, RecordStore, StoreError};
use crate::types::DuplicateStrategy;

/// Hard ceiling on the worker pool, whatever the configuration says.
pub const MAX_CONCURRENCY: usize = 10;

/// Subset of application config consumed by the upload engine.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub concurrency: usize,
    pub duplicate_strategy: DuplicateStrategy,
    /// Include records whose previous upload failed terminally.
    pub include_failed: bool,
    pub retry: RetryPolicy,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            duplicate_strategy: DuplicateStrategy::Skip,
            include_failed: true,
            retry: RetryPolicy::default(),
            dry_run: false,
            no_progress_bar: true,
        }
    }
}

/// Outcome of an upload pass.
#[derive(Debug, Clone, Default)]
pub struct UploadSummary {
    /// Records eligible at the start of the pass.
    pub queued: u64,
    pub uploaded: u64,
    pub failed: u64,
    /// Records skipped because another pass completed them first.
    pub skipped: u64,
    pub interrupted: bool,
}

/// One queued record. Carries the attempt count so a re-enqueued item
/// resumes its own retry budget.
struct QueueItem {
    external_id: String,
    url: String,
    destination_folder_id: Option<String>,
    attempts_made: u32,
}

/// Shared FIFO with completion tracking. The sender is dropped once every
/// enqueued item has finished, which closes the channel and lets workers
/// drain out.
struct UploadQueue {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<QueueItem>>>,
    outstanding: AtomicU64,
}

impl UploadQueue {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            outstanding: AtomicU64::new(0),
        });
        (queue, rx)
    }

    /// Add a new item.
    fn enqueue(&self, item: QueueItem) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.send(item);
    }

    /// Put an in-flight item back on the queue (after a retry delay). Does
    /// not touch the outstanding count: the item was never finished.
    fn resend(&self, item: QueueItem) {
        self.send(item);
    }

    fn send(&self, item: QueueItem) {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(item);
            }
        }
    }

    /// Mark one item as done. Closes the queue when nothing is left.
    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Per-pass counters shared by the workers.
#[derive(Default)]
struct Counters {
    uploaded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Entry point for the upload engine.
pub async fn run_upload(
    store: Arc<dyn RecordStore>,
    importer: Arc<dyn RemoteImporter>,
    limiter: Arc<RateLimiter>,
    options: &UploadOptions,
    shutdown: CancellationToken,
) -> Result<UploadSummary, StoreError> {
    let records = store
        .get_uploadable(
            options.duplicate_strategy.uploads_duplicates(),
            options.include_failed,
        )
        .await?;

    if options.dry_run {
        for record in &records {
            tracing::info!("[DRY RUN] Would upload {} ({})", record.name, record.external_id);
        }
        return Ok(UploadSummary {
            queued: records.len() as u64,
            ..Default::default()
        });
    }

    if records.is_empty() {
        tracing::info!("No files to upload");
        return Ok(UploadSummary::default());
    }

    let pb = create_progress_bar(options.no_progress_bar, records.len() as u64);
    let (queue, rx) = UploadQueue::new();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let counters = Arc::new(Counters::default());
    let summary_queued = records.len() as u64;

    for record in records {
        let attempts_made = record.import_response.map(|r| r.attempts()).unwrap_or(0);
        queue.enqueue(QueueItem {
            external_id: record.external_id,
            url: record.url,
            destination_folder_id: record.destination_folder_id,
            attempts_made,
        });
    }

    let concurrency = options.concurrency.clamp(1, MAX_CONCURRENCY);
    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let store = store.clone();
        let importer = importer.clone();
        let limiter = limiter.clone();
        let queue = queue.clone();
        let rx = rx.clone();
        let counters = counters.clone();
        let shutdown = shutdown.clone();
        let pb = pb.clone();
        let policy = options.retry;

        workers.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let item = match item {
                    Some(item) => item,
                    None => break, // queue drained and closed
                };

                if shutdown.is_cancelled() {
                    // Leave the record pending in the store; a later run
                    // resumes it. Just drain the queue.
                    queue.finish();
                    continue;
                }

                process_item(
                    store.as_ref(),
                    importer.as_ref(),
                    &limiter,
                    &policy,
                    &queue,
                    &counters,
                    &pb,
                    &shutdown,
                    item,
                )
                .await;
            }
        }));
    }

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!("Upload worker panicked: {}", e);
        }
    }
    pb.finish_and_clear();

    let summary = UploadSummary {
        queued: summary_queued,
        uploaded: counters.uploaded.load(Ordering::SeqCst),
        failed: counters.failed.load(Ordering::SeqCst),
        skipped: counters.skipped.load(Ordering::SeqCst),
        interrupted: shutdown.is_cancelled(),
    };
    tracing::info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        skipped = summary.skipped,
        "Upload pass complete"
    );
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn process_item(
    store: &dyn RecordStore,
    importer: &dyn RemoteImporter,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    queue: &Arc<UploadQueue>,
    counters: &Counters,
    pb: &ProgressBar,
    shutdown: &CancellationToken,
    item: QueueItem,
) {
    match store.claim_for_upload(&item.external_id).await {
        Ok(true) => {}
        Ok(false) => {
            // Completed by another pass since the queue was built.
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            pb.inc(1);
            queue.finish();
            return;
        }
        Err(e) => {
            pb.suspend(|| tracing::error!("Failed to claim {}: {}", item.external_id, e));
            counters.failed.fetch_add(1, Ordering::SeqCst);
            pb.inc(1);
            queue.finish();
            return;
        }
    }

    limiter.acquire().await;

    let attempts = item.attempts_made + 1;
    let result = importer
        .upload(&item.url, item.destination_folder_id.as_deref())
        .await;

    match result {
        Ok(receipt) => {
            let response = ImportResponse::Success {
                destination_id: receipt.destination_id.clone(),
                attempts,
                last_attempt_at: Utc::now(),
            };
            if let Err(e) = store
                .mark_uploaded(&item.external_id, &receipt.destination_id, &response)
                .await
            {
                pb.suspend(|| {
                    tracing::error!("Failed to record upload of {}: {}", item.external_id, e)
                });
                counters.failed.fetch_add(1, Ordering::SeqCst);
            } else {
                counters.uploaded.fetch_add(1, Ordering::SeqCst);
            }
            pb.set_message(item.external_id.clone());
            pb.inc(1);
            queue.finish();
        }
        Err(e) => {
            let response = ImportResponse::Failure {
                code: e.status_code(),
                message: e.to_string(),
                attempts,
                last_attempt_at: Utc::now(),
            };
            match policy.decide(e.is_retryable(), attempts) {
                RetryAction::Retry => {
                    let delay = policy.delay_after(attempts);
                    pb.suspend(|| {
                        tracing::warn!(
                            "Upload of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            item.external_id,
                            attempts,
                            policy.max_attempts,
                            delay,
                            e
                        )
                    });
                    if let Err(e) = store
                        .mark_upload_retrying(&item.external_id, &response, &e.to_string())
                        .await
                    {
                        pb.suspend(|| {
                            tracing::error!("Failed to record retry of {}: {}", item.external_id, e)
                        });
                        counters.failed.fetch_add(1, Ordering::SeqCst);
                        pb.inc(1);
                        queue.finish();
                        return;
                    }
                    // Scheduler re-enqueue: the delay runs in its own task
                    // so this worker is free for the next record.
                    let queue = queue.clone();
                    let shutdown = shutdown.clone();
                    let retry_item = QueueItem {
                        attempts_made: attempts,
                        ..item
                    };
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => {}
                        }
                        queue.resend(retry_item);
                    });
                }
                RetryAction::Abort => {
                    pb.suspend(|| {
                        tracing::error!(
                            "Upload of {} failed permanently after {} attempt(s): {}",
                            item.external_id,
                            attempts,
                            e
                        )
                    });
                    if let Err(store_err) = store
                        .mark_upload_failed(&item.external_id, &response, &e.to_string())
                        .await
                    {
                        pb.suspend(|| {
                            tracing::error!(
                                "Failed to record failure of {}: {}",
                                item.external_id,
                                store_err
                            )
                        });
                    }
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    pb.inc(1);
                    queue.finish();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptedImporter;
    use crate::remote::{RemoteError, UploadReceipt};
    use crate::store::{NewFileRecord, SqliteRecordStore, UploadStatus};
    use std::time::Duration;

    fn record(id: &str) -> NewFileRecord {
        NewFileRecord {
            external_id: id.to_string(),
            name: format!("{id}.pdf"),
            url: format!("https://source.example/files/{id}"),
            size: Some(100),
            mime_type: Some("application/pdf".to_string()),
            file_hash: None,
            duplicate_of: None,
            destination_folder_id: None,
        }
    }

    fn dup_record(id: &str, of: &str) -> NewFileRecord {
        NewFileRecord {
            file_hash: Some("h".to_string()),
            duplicate_of: Some(of.to_string()),
            ..record(id)
        }
    }

    fn options() -> UploadOptions {
        UploadOptions {
            concurrency: 2,
            duplicate_strategy: DuplicateStrategy::Skip,
            include_failed: true,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            dry_run: false,
            no_progress_bar: true,
        }
    }

    fn receipt(id: &str) -> Result<UploadReceipt, RemoteError> {
        Ok(UploadReceipt {
            destination_id: id.to_string(),
        })
    }

    fn status_err(status: u16) -> Result<UploadReceipt, RemoteError> {
        Err(RemoteError::Status {
            status,
            message: "scripted".to_string(),
        })
    }

    async fn store_with(records: &[NewFileRecord]) -> Arc<SqliteRecordStore> {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        for r in records {
            assert!(store.insert_discovered(r).await.unwrap());
        }
        store
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Duration::ZERO))
    }

    #[tokio::test]
    async fn uploads_pending_records() {
        let store = store_with(&[record("A"), record("B")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![receipt("dest-A")]);
        importer.script_upload("https://source.example/files/B", vec![receipt("dest-B")]);

        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.failed, 0);

        let rec = store.get("A").await.unwrap().unwrap();
        assert_eq!(rec.upload_status, UploadStatus::Completed);
        assert_eq!(rec.destination_id.as_deref(), Some("dest-A"));
        assert_eq!(rec.processing_status.unwrap().as_str(), "pending");
        assert!(rec.uploaded_at.is_some());
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let store = store_with(&[record("A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload(
            "https://source.example/files/A",
            vec![status_err(503), status_err(503), receipt("dest-A")],
        );

        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.uploaded, 1);
        assert_eq!(importer.upload_calls.lock().unwrap().len(), 3);

        let rec = store.get("A").await.unwrap().unwrap();
        assert_eq!(rec.upload_status, UploadStatus::Completed);
        assert_eq!(rec.import_response.unwrap().attempts(), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_attempt_budget() {
        let store = store_with(&[record("A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![status_err(503)]);

        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.failed, 1);
        // max_attempts bounds the calls
        assert_eq!(importer.upload_calls.lock().unwrap().len(), 3);

        let rec = store.get("A").await.unwrap().unwrap();
        assert_eq!(rec.upload_status, UploadStatus::Failed);
        assert!(rec.destination_id.is_none());
        assert_eq!(rec.import_response.unwrap().attempts(), 3);
        assert!(rec.last_error.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_aborts_without_retry() {
        let store = store_with(&[record("A"), record("B")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![status_err(422)]);
        importer.script_upload("https://source.example/files/B", vec![receipt("dest-B")]);

        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // One record failing never blocks the rest of the batch
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 1);
        let calls = importer.upload_calls.lock().unwrap();
        assert_eq!(
            calls
                .iter()
                .filter(|u| u.ends_with("/A"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn skip_strategy_excludes_duplicates() {
        let store = store_with(&[record("A"), dup_record("B", "A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![receipt("dest-A")]);

        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.uploaded, 1);
        assert!(importer
            .upload_calls
            .lock()
            .unwrap()
            .iter()
            .all(|u| u.ends_with("/A")));
        let rec = store.get("B").await.unwrap().unwrap();
        assert_eq!(rec.upload_status, UploadStatus::Pending);
    }

    #[tokio::test]
    async fn upload_strategy_includes_duplicates() {
        let store = store_with(&[record("A"), dup_record("B", "A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![receipt("dest-A")]);
        importer.script_upload("https://source.example/files/B", vec![receipt("dest-B")]);

        let opts = UploadOptions {
            duplicate_strategy: DuplicateStrategy::Upload,
            ..options()
        };
        let summary = run_upload(
            store.clone(),
            importer,
            limiter(),
            &opts,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.uploaded, 2);
    }

    #[tokio::test]
    async fn completed_records_are_never_resubmitted() {
        let store = store_with(&[record("A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![receipt("dest-A")]);

        let first = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(first.uploaded, 1);

        let second = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.uploaded, 0);
        assert_eq!(importer.upload_calls.lock().unwrap().len(), 1);

        // Destination id was assigned exactly once
        let rec = store.get("A").await.unwrap().unwrap();
        assert_eq!(rec.destination_id.as_deref(), Some("dest-A"));
    }

    #[tokio::test]
    async fn failed_records_excluded_when_configured() {
        let store = store_with(&[record("A")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        importer.script_upload("https://source.example/files/A", vec![status_err(400)]);

        run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            store.get("A").await.unwrap().unwrap().upload_status,
            UploadStatus::Failed
        );

        let opts = UploadOptions {
            include_failed: false,
            ..options()
        };
        let summary = run_upload(store, importer, limiter(), &opts, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.queued, 0);
    }

    #[tokio::test]
    async fn dry_run_calls_nothing() {
        let store = store_with(&[record("A"), record("B")]).await;
        let importer = Arc::new(ScriptedImporter::new());

        let opts = UploadOptions {
            dry_run: true,
            ..options()
        };
        let summary = run_upload(
            store.clone(),
            importer.clone(),
            limiter(),
            &opts,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.queued, 2);
        assert_eq!(summary.uploaded, 0);
        assert!(importer.upload_calls.lock().unwrap().is_empty());
        assert_eq!(
            store.get("A").await.unwrap().unwrap().upload_status,
            UploadStatus::Pending
        );
    }

    #[tokio::test]
    async fn cancelled_token_leaves_records_pending() {
        let store = store_with(&[record("A"), record("B")]).await;
        let importer = Arc::new(ScriptedImporter::new());
        let token = CancellationToken::new();
        token.cancel();

        let summary = run_upload(store.clone(), importer.clone(), limiter(), &options(), token)
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.uploaded, 0);
        assert!(importer.upload_calls.lock().unwrap().is_empty());
        assert_eq!(
            store.get("A").await.unwrap().unwrap().upload_status,
            UploadStatus::Pending
        );
    }
}
