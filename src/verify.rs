//! Verification phase — polls the remote service until uploads finish
//! processing.
//!
//! Each round polls every record with a destination id and a non-terminal
//! processing status, then sleeps for the poll interval. The loop ends when
//! no records remain non-terminal, the deadline passes, or shutdown is
//! requested; in every case the statuses recorded so far are kept.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;
use crate::remote::RemoteImporter;
use crate::store::{ProcessingStatus, RecordStore, StoreError, VerificationResponse};

/// Subset of application config consumed by the verification engine.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Wait between polling rounds.
    pub poll_interval: Duration,
    /// Give up after this long, leaving the remainder `processing`.
    pub timeout: Duration,
    /// Poll at most this many records per round.
    pub batch_size: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            batch_size: 50,
        }
    }
}

/// Outcome of a verification pass. A timeout or shutdown yields a partial
/// summary; nothing recorded is rolled back.
#[derive(Debug, Clone, Default)]
pub struct VerifySummary {
    /// Status polls issued.
    pub polls: u64,
    /// Records confirmed processed.
    pub completed: u64,
    /// Records the remote service reports as failed.
    pub failed: u64,
    /// Records still processing when the pass ended.
    pub still_processing: u64,
    /// Polls that errored (recorded, status left unchanged).
    pub poll_errors: u64,
    pub timed_out: bool,
    pub interrupted: bool,
}

/// Map a remote status string onto the local processing status.
///
/// Unrecognized values are logged by the caller and treated as still
/// processing so a service rollout with new vocabulary never wedges records
/// into a bogus terminal state.
fn map_remote_status(remote: &str) -> Option<ProcessingStatus> {
    match remote.to_ascii_lowercase().as_str() {
        "pending" | "processing" | "queued" => Some(ProcessingStatus::Processing),
        "completed" | "succeeded" => Some(ProcessingStatus::Completed),
        "failed" | "error" => Some(ProcessingStatus::Failed),
        _ => None,
    }
}

/// Entry point for the verification engine.
pub async fn run_verify(
    store: Arc<dyn RecordStore>,
    importer: Arc<dyn RemoteImporter>,
    limiter: Arc<RateLimiter>,
    options: &VerifyOptions,
    shutdown: CancellationToken,
) -> Result<VerifySummary, StoreError> {
    let mut summary = VerifySummary::default();
    let deadline = Instant::now() + options.timeout;

    loop {
        let remaining = store.get_verifiable().await?;
        if remaining.is_empty() {
            break;
        }

        if shutdown.is_cancelled() {
            summary.interrupted = true;
            summary.still_processing = remaining.len() as u64;
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                remaining = remaining.len(),
                "Verification deadline reached, leaving remainder processing"
            );
            summary.timed_out = true;
            summary.still_processing = remaining.len() as u64;
            break;
        }

        // Every eligible record is polled each round; batching only bounds
        // how many go between shutdown/deadline checks.
        'round: for batch in remaining.chunks(options.batch_size) {
            if shutdown.is_cancelled() || Instant::now() >= deadline {
                break 'round;
            }
            for record in batch {
                if shutdown.is_cancelled() {
                    break 'round;
                }
                let destination_id = match record.destination_id.as_deref() {
                    Some(id) => id,
                    None => continue, // get_verifiable guarantees this
                };

                limiter.acquire().await;
                summary.polls += 1;

                match importer.get_status(destination_id).await {
                    Ok(remote) => {
                        let status = match map_remote_status(&remote.status) {
                            Some(status) => status,
                            None => {
                                tracing::warn!(
                                    external_id = %record.external_id,
                                    "Unrecognized remote status '{}', treating as processing",
                                    remote.status
                                );
                                ProcessingStatus::Processing
                            }
                        };
                        let response = VerificationResponse::Status {
                            remote_status: remote.status,
                            message: remote.message,
                            checked_at: Utc::now(),
                        };
                        store
                            .record_verification(&record.external_id, status, &response)
                            .await?;
                        match status {
                            ProcessingStatus::Completed => {
                                tracing::debug!(external_id = %record.external_id, "Processing complete");
                                summary.completed += 1;
                            }
                            ProcessingStatus::Failed => {
                                tracing::warn!(
                                    external_id = %record.external_id,
                                    "Remote processing failed"
                                );
                                summary.failed += 1;
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        // The poll failed, not the processing; status unchanged.
                        tracing::warn!(
                            external_id = %record.external_id,
                            "Status poll failed: {}", e
                        );
                        summary.poll_errors += 1;
                        let response = VerificationResponse::Error {
                            code: e.status_code(),
                            message: e.to_string(),
                            checked_at: Utc::now(),
                        };
                        store
                            .record_verification_error(&record.external_id, &response, &e.to_string())
                            .await?;
                    }
                }
            }
        }

        // Re-query before sleeping so a fully terminal set exits promptly.
        if store.get_verifiable().await?.is_empty() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(options.poll_interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    tracing::info!(
        polls = summary.polls,
        completed = summary.completed,
        failed = summary.failed,
        still_processing = summary.still_processing,
        poll_errors = summary.poll_errors,
        "Verification pass complete"
    );
    Ok(summary)
}
