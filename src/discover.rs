//! Discovery phase — walks the source listing and records every file.
//!
//! Each descriptor is fingerprinted, checked against earlier records for a
//! metadata duplicate, and inserted with `upload_status=pending`. Inserting
//! an already-known external id is a no-op, which is what makes re-running
//! discovery against an unchanged listing idempotent.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::dedup;
use crate::source::SourceLister;
use crate::store::{NewFileRecord, RecordStore};

/// Options for a discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Source container to list.
    pub container: String,
    /// Walk nested containers.
    pub recursive: bool,
    /// Stop after this many descriptors.
    pub max_items: Option<usize>,
    /// Destination folder recorded on each new row, passed to the importer
    /// at upload time.
    pub destination_folder_id: Option<String>,
}

/// Outcome of a discovery pass. Per-file failures are counted here rather
/// than aborting the batch.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySummary {
    /// Descriptors seen from the source.
    pub listed: u64,
    /// New records inserted.
    pub inserted: u64,
    /// Descriptors whose external id was already tracked.
    pub already_known: u64,
    /// New records flagged as duplicates of an earlier record.
    pub duplicates_flagged: u64,
    /// Files that could not be recorded (logged individually).
    pub errors: u64,
    /// True when the listing itself failed partway; everything listed
    /// before the failure was still processed.
    pub listing_failed: bool,
    /// True when a shutdown request stopped the pass early.
    pub interrupted: bool,
}

/// Run the discovery phase.
pub async fn run_discovery(
    store: Arc<dyn RecordStore>,
    lister: &dyn SourceLister,
    options: &DiscoverOptions,
    shutdown: CancellationToken,
) -> DiscoverySummary {
    let mut summary = DiscoverySummary::default();
    let mut stream = lister.list(&options.container, options.recursive, options.max_items);

    while let Some(result) = stream.next().await {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, stopping discovery");
            summary.interrupted = true;
            break;
        }

        let file = match result {
            Ok(file) => file,
            Err(e) => {
                // One error per listing attempt; keep whatever was listed.
                tracing::error!("Source listing failed: {}", e);
                summary.listing_failed = true;
                break;
            }
        };
        summary.listed += 1;

        let file_hash = dedup::fingerprint(file.size, &file.name, file.mime_type.as_deref());

        let duplicate_of =
            match dedup::find_duplicate(store.as_ref(), file_hash.as_deref(), &file.external_id)
                .await
            {
                Ok(dup) => dup,
                Err(e) => {
                    tracing::warn!(
                        external_id = %file.external_id,
                        "Duplicate lookup failed, recording without flag: {}", e
                    );
                    None
                }
            };

        if let Some(original) = &duplicate_of {
            tracing::debug!(
                external_id = %file.external_id,
                duplicate_of = %original,
                "Metadata duplicate detected"
            );
        }

        let record = NewFileRecord {
            external_id: file.external_id.clone(),
            name: file.name,
            url: file.url,
            size: file.size,
            mime_type: file.mime_type,
            file_hash,
            duplicate_of: duplicate_of.clone(),
            destination_folder_id: options.destination_folder_id.clone(),
        };

        match store.insert_discovered(&record).await {
            Ok(true) => {
                summary.inserted += 1;
                if duplicate_of.is_some() {
                    summary.duplicates_flagged += 1;
                }
            }
            Ok(false) => summary.already_known += 1,
            Err(e) => {
                tracing::warn!(
                    external_id = %record.external_id,
                    "Failed to record discovered file: {}", e
                );
                summary.errors += 1;
            }
        }
    }

    tracing::info!(
        listed = summary.listed,
        inserted = summary.inserted,
        already_known = summary.already_known,
        duplicates = summary.duplicates_flagged,
        "Discovery complete"
    );
    summary
}
