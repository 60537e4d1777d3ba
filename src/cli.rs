use clap::{Args, Parser, Subcommand};

use crate::types::{DuplicateStrategy, LogLevel, ReportFormat};

#[derive(Parser, Debug)]
#[command(
    name = "driveimport-rs",
    about = "Import files from a content source into a remote processing service"
)]
pub struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full pipeline: discover, upload, verify
    Run(RunArgs),
    /// Discover files from the source and record them, without uploading
    Discover(DiscoverArgs),
    /// Upload previously discovered files
    Upload(UploadArgs),
    /// Poll the remote service until uploaded files finish processing
    Verify(VerifyArgs),
    /// Show a summary of the state database
    Status(StatusArgs),
    /// List groups of files with identical metadata fingerprints
    Duplicates(DuplicatesArgs),
    /// Return failed uploads to the pending queue
    RetryFailed(RetryFailedArgs),
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Path to the state database
    #[arg(long, default_value = "~/.driveimport-rs/driveimport.db")]
    pub db: String,
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Base URL of the source listing API
    #[arg(long, env = "DRIVEIMPORT_SOURCE_URL")]
    pub source_url: String,

    /// Token for the source listing API, when it requires one
    #[arg(long, env = "DRIVEIMPORT_SOURCE_TOKEN")]
    pub source_token: Option<String>,

    /// Source container to list
    #[arg(long, default_value = "root")]
    pub container: String,

    /// Walk nested containers
    #[arg(long)]
    pub recursive: bool,

    /// Stop discovery after this many files
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Destination folder passed to the remote importer for new records
    #[arg(long)]
    pub destination_folder: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Base URL of the remote importer API
    #[arg(long, env = "DRIVEIMPORT_REMOTE_URL")]
    pub remote_url: String,

    /// API token (if not provided, will prompt).
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the DRIVEIMPORT_TOKEN environment variable instead.
    #[arg(long, env = "DRIVEIMPORT_TOKEN")]
    pub token: Option<String>,
}

#[derive(Args, Debug)]
pub struct UploadFlags {
    /// Concurrent upload workers (capped at 10)
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,

    /// Maximum upload attempts per file
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base retry delay in seconds (attempt N waits N times this)
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Ceiling on remote calls per minute (0 disables rate limiting)
    #[arg(long, default_value_t = 60)]
    pub rate_limit_rpm: u32,

    /// What to do with files flagged as metadata duplicates
    #[arg(long, value_enum, default_value = "skip")]
    pub duplicate_strategy: DuplicateStrategy,

    /// Exclude files whose previous upload failed
    #[arg(long)]
    pub no_retry_failed: bool,

    /// Preview the upload queue without submitting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct VerifyFlags {
    /// Seconds between polling rounds
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Give up verifying after this many seconds
    #[arg(long, default_value_t = 600)]
    pub verify_timeout: u64,

    /// Records polled per round
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,

    /// Ceiling on remote calls per minute (0 disables rate limiting)
    #[arg(long, default_value_t = 60)]
    pub rate_limit_rpm: u32,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[command(flatten)]
    pub upload: UploadFlags,

    /// Seconds between verification polling rounds
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Give up verifying after this many seconds
    #[arg(long, default_value_t = 600)]
    pub verify_timeout: u64,

    /// Records polled per verification round
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[command(flatten)]
    pub upload: UploadFlags,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[command(flatten)]
    pub verify: VerifyFlags,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Also list failed uploads with their last error
    #[arg(long)]
    pub failed: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: ReportFormat,
}

#[derive(Args, Debug)]
pub struct DuplicatesArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: ReportFormat,
}

#[derive(Args, Debug)]
pub struct RetryFailedArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}
