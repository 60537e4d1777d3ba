//! CLI-to-engine configuration, validated before any phase runs.

use std::path::PathBuf;
use std::time::Duration;

use crate::cli;
use crate::discover::DiscoverOptions;
use crate::retry::RetryPolicy;
use crate::upload::{UploadOptions, MAX_CONCURRENCY};
use crate::verify::VerifyOptions;

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Resolve the state database path, creating its parent directory.
pub fn db_path(store: &cli::StoreArgs) -> anyhow::Result<PathBuf> {
    let path = expand_tilde(&store.db);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(path)
}

pub fn discover_options(source: &cli::SourceArgs) -> anyhow::Result<DiscoverOptions> {
    if source.source_url.trim().is_empty() {
        anyhow::bail!("--source-url must not be empty");
    }
    if source.max_items == Some(0) {
        anyhow::bail!("--max-items must be at least 1");
    }
    Ok(DiscoverOptions {
        container: source.container.clone(),
        recursive: source.recursive,
        max_items: source.max_items,
        destination_folder_id: source.destination_folder.clone(),
    })
}

pub fn upload_options(flags: &cli::UploadFlags) -> anyhow::Result<UploadOptions> {
    if flags.concurrency == 0 {
        anyhow::bail!("--concurrency must be at least 1");
    }
    if flags.concurrency > MAX_CONCURRENCY {
        anyhow::bail!("--concurrency must be at most {}", MAX_CONCURRENCY);
    }
    if flags.max_retries == 0 {
        anyhow::bail!("--max-retries must be at least 1");
    }
    Ok(UploadOptions {
        concurrency: flags.concurrency,
        duplicate_strategy: flags.duplicate_strategy,
        include_failed: !flags.no_retry_failed,
        retry: RetryPolicy {
            max_attempts: flags.max_retries,
            base_delay: Duration::from_secs(flags.retry_delay),
        },
        dry_run: flags.dry_run,
        no_progress_bar: flags.no_progress_bar,
    })
}

pub fn verify_options(
    poll_interval: u64,
    verify_timeout: u64,
    batch_size: usize,
) -> anyhow::Result<VerifyOptions> {
    if poll_interval == 0 {
        anyhow::bail!("--poll-interval must be at least 1 second");
    }
    if verify_timeout == 0 {
        anyhow::bail!("--verify-timeout must be at least 1 second");
    }
    if batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }
    Ok(VerifyOptions {
        poll_interval: Duration::from_secs(poll_interval),
        timeout: Duration::from_secs(verify_timeout),
        batch_size,
    })
}

/// Remote connection details with a resolved token.
#[derive(Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Resolve remote connection details, prompting for the token when it was
/// given neither on the command line nor in the environment.
pub fn remote_config(remote: &cli::RemoteArgs) -> anyhow::Result<RemoteConfig> {
    if remote.remote_url.trim().is_empty() {
        anyhow::bail!("--remote-url must not be empty");
    }
    let token = match &remote.token {
        Some(token) => token.clone(),
        None => rpassword::prompt_password("API token: ")?,
    };
    if token.is_empty() {
        anyhow::bail!("API token must not be empty");
    }
    Ok(RemoteConfig {
        base_url: remote.remote_url.clone(),
        token,
    })
}
