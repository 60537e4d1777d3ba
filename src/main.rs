//! driveimport-rs — imports files from an external content source into a
//! remote content-processing service.
//!
//! Three phases: discovery lists the source and records every file in a
//! SQLite state database, upload submits pending records with bounded
//! concurrency and linear-backoff retries, verification polls the remote
//! service until processing finishes. Every phase is idempotent and
//! resumable; re-running against an unchanged source does no duplicate work.

#![warn(clippy::all)]

mod cli;
mod config;
mod dedup;
mod discover;
mod ratelimit;
mod remote;
mod retry;
mod shutdown;
mod source;
mod store;
mod types;
mod upload;
mod verify;
mod workflow;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ratelimit::RateLimiter;
use store::{RecordStore, SqliteRecordStore};
use types::ReportFormat;

/// Open the state database, or explain that none exists yet. Used by the
/// read-only commands, which should not create an empty database.
async fn open_existing_store(path: &Path) -> anyhow::Result<Option<SqliteRecordStore>> {
    if !path.exists() {
        println!("No state database found at {}", path.display());
        println!("Run `driveimport-rs run` or `discover` first to create it.");
        return Ok(None);
    }
    Ok(Some(SqliteRecordStore::open(path).await?))
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = config::db_path(&args.store)?;
    let store = match open_existing_store(&db_path).await? {
        Some(store) => store,
        None => return Ok(()),
    };
    let summary = store.get_summary().await?;

    if args.format == ReportFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("State Database: {}", db_path.display());
    println!();
    println!("Files:");
    println!("  Total:         {}", summary.total_files);
    println!("  Pending:       {}", summary.pending);
    println!("  Uploading:     {}", summary.uploading);
    println!("  Uploaded:      {}", summary.uploaded);
    println!("  Upload failed: {}", summary.upload_failed);
    println!();
    println!("Processing:");
    println!("  Completed:     {}", summary.processing_completed);
    println!("  Failed:        {}", summary.processing_failed);
    println!();
    println!("Duplicates flagged: {}", summary.duplicates);

    if let Some(started) = &summary.last_run_started {
        println!();
        println!(
            "Last run started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last run completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if args.failed && summary.upload_failed > 0 {
        println!();
        println!("Failed uploads:");
        let failed = store.get_failed().await?;
        for record in failed {
            println!(
                "  {} ({}) - {}",
                record.name,
                record.external_id,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the duplicates command.
async fn run_duplicates(args: cli::DuplicatesArgs) -> anyhow::Result<()> {
    let db_path = config::db_path(&args.store)?;
    let store = match open_existing_store(&db_path).await? {
        Some(store) => store,
        None => return Ok(()),
    };
    let groups = dedup::find_all_duplicate_groups(&store).await?;

    if args.format == ReportFormat::Json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("No duplicate groups found.");
        return Ok(());
    }

    println!("{} duplicate group(s):", groups.len());
    for group in &groups {
        println!();
        println!("Fingerprint {}:", group.file_hash);
        for member in &group.members {
            println!(
                "  {} ({}, {} bytes, {})",
                member.name,
                member.external_id,
                member.size.unwrap_or(0),
                member.mime_type.as_deref().unwrap_or("unknown"),
            );
        }
    }
    Ok(())
}

/// Run the retry-failed command.
async fn run_retry_failed(args: cli::RetryFailedArgs) -> anyhow::Result<()> {
    let db_path = config::db_path(&args.store)?;
    let store = match open_existing_store(&db_path).await? {
        Some(store) => store,
        None => return Ok(()),
    };
    let count = store.requeue_failed().await?;
    if count > 0 {
        println!("Returned {} failed upload(s) to the pending queue.", count);
        println!("Run `driveimport-rs upload` to retry them.");
    } else {
        println!("No failed uploads to retry.");
    }
    Ok(())
}

/// Run the discover command.
async fn run_discover(args: cli::DiscoverArgs) -> anyhow::Result<()> {
    let options = config::discover_options(&args.source)?;
    let db_path = config::db_path(&args.store)?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&db_path).await?);
    let lister = source::HttpSourceLister::new(
        args.source.source_url.clone(),
        args.source.source_token.clone().unwrap_or_default(),
    )?;
    let shutdown_token = shutdown::install_signal_handler();

    let summary = discover::run_discovery(store, &lister, &options, shutdown_token).await;

    println!("Discovery complete:");
    println!("  Listed:        {}", summary.listed);
    println!("  New:           {}", summary.inserted);
    println!("  Already known: {}", summary.already_known);
    println!("  Duplicates:    {}", summary.duplicates_flagged);
    if summary.errors > 0 {
        println!("  Errors:        {}", summary.errors);
    }
    if summary.listing_failed {
        anyhow::bail!("Source listing failed partway; results above are partial");
    }
    Ok(())
}

/// Run the upload command.
async fn run_upload_cmd(args: cli::UploadArgs) -> anyhow::Result<()> {
    let options = config::upload_options(&args.upload)?;
    let remote_cfg = config::remote_config(&args.remote)?;
    let db_path = config::db_path(&args.store)?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&db_path).await?);
    let importer: Arc<dyn remote::RemoteImporter> = Arc::new(remote::HttpRemoteImporter::new(
        remote_cfg.base_url,
        remote_cfg.token,
    )?);
    let limiter = Arc::new(RateLimiter::per_minute(args.upload.rate_limit_rpm));
    let shutdown_token = shutdown::install_signal_handler();

    let summary = upload::run_upload(store, importer, limiter, &options, shutdown_token).await?;

    println!("Upload complete:");
    println!("  Queued:   {}", summary.queued);
    println!("  Uploaded: {}", summary.uploaded);
    println!("  Failed:   {}", summary.failed);
    if summary.failed > 0 {
        anyhow::bail!("{} upload(s) failed", summary.failed);
    }
    Ok(())
}

/// Run the verify command.
async fn run_verify_cmd(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let options = config::verify_options(
        args.verify.poll_interval,
        args.verify.verify_timeout,
        args.verify.batch_size,
    )?;
    let remote_cfg = config::remote_config(&args.remote)?;
    let db_path = config::db_path(&args.store)?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&db_path).await?);
    let importer: Arc<dyn remote::RemoteImporter> = Arc::new(remote::HttpRemoteImporter::new(
        remote_cfg.base_url,
        remote_cfg.token,
    )?);
    let limiter = Arc::new(RateLimiter::per_minute(args.verify.rate_limit_rpm));
    let shutdown_token = shutdown::install_signal_handler();

    let summary = verify::run_verify(store, importer, limiter, &options, shutdown_token).await?;

    println!("Verification complete:");
    println!("  Completed:        {}", summary.completed);
    println!("  Failed:           {}", summary.failed);
    println!("  Still processing: {}", summary.still_processing);
    verify_outcome(&summary)
}

/// Fold a verification summary into the command result, so an incomplete
/// pass exits non-zero through the same error path as the other commands.
fn verify_outcome(summary: &verify::VerifySummary) -> anyhow::Result<()> {
    if summary.timed_out {
        anyhow::bail!(
            "verification timed out with {} record(s) still processing",
            summary.still_processing
        );
    }
    if summary.failed > 0 {
        anyhow::bail!("{} import(s) failed remote processing", summary.failed);
    }
    Ok(())
}

/// Run the full pipeline.
async fn run_pipeline_cmd(args: cli::RunArgs) -> anyhow::Result<()> {
    let options = workflow::WorkflowOptions {
        discover: config::discover_options(&args.source)?,
        upload: config::upload_options(&args.upload)?,
        verify: config::verify_options(args.poll_interval, args.verify_timeout, args.batch_size)?,
    };
    let remote_cfg = config::remote_config(&args.remote)?;
    let db_path = config::db_path(&args.store)?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&db_path).await?);
    tracing::info!("State database at {}", db_path.display());

    let lister = source::HttpSourceLister::new(
        args.source.source_url.clone(),
        args.source.source_token.clone().unwrap_or_default(),
    )?;
    let importer: Arc<dyn remote::RemoteImporter> = Arc::new(remote::HttpRemoteImporter::new(
        remote_cfg.base_url,
        remote_cfg.token,
    )?);
    let limiter = Arc::new(RateLimiter::per_minute(args.upload.rate_limit_rpm));
    let shutdown_token = shutdown::install_signal_handler();

    tracing::info!(
        concurrency = options.upload.concurrency,
        "Starting driveimport-rs"
    );
    let report = workflow::run_pipeline(
        store,
        &lister,
        importer,
        limiter,
        &options,
        shutdown_token.clone(),
    )
    .await?;

    if options.upload.dry_run {
        println!("── Dry Run Summary ──");
        println!("  {} file(s) would be uploaded", report.upload.queued);
        return Ok(());
    }

    println!("Run complete:");
    println!("  Discovered: {}", report.discovery.inserted);
    println!("  Uploaded:   {}", report.upload.uploaded);
    println!("  Failed:     {}", report.upload.failed);
    if let Some(verify) = &report.verify {
        println!("  Verified:   {}", verify.completed);
        if verify.still_processing > 0 {
            println!("  Still processing: {}", verify.still_processing);
        }
    }
    if shutdown_token.is_cancelled() {
        println!("  Interrupted — the next run resumes from here.");
    }
    if report.upload.failed > 0 {
        anyhow::bail!("{} upload(s) failed", report.upload.failed);
    }
    Ok(())
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = match cli.log_level {
        types::LogLevel::Debug => "debug",
        types::LogLevel::Info => "info",
        types::LogLevel::Warn => "warn",
        types::LogLevel::Error => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        cli::Command::Run(args) => run_pipeline_cmd(args).await,
        cli::Command::Discover(args) => run_discover(args).await,
        cli::Command::Upload(args) => run_upload_cmd(args).await,
        cli::Command::Verify(args) => run_verify_cmd(args).await,
        cli::Command::Status(args) => run_status(args).await,
        cli::Command::Duplicates(args) => run_duplicates(args).await,
        cli::Command::RetryFailed(args) => run_retry_failed(args).await,
    }
}
