use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

/// Settings for the transfer engine
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Root directory for finished episodes; partial files live in `.partial/`
    pub download_dir: PathBuf,
    /// Extra attempts after the first one
    pub retry_count: u32,
    /// Delay after the first failed attempt
    pub base_backoff: Duration,
    /// Upper bound for any single backoff delay
    pub max_backoff: Duration,
}

impl DownloadConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            retry_count: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (zero-based): `base * 2^attempt`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Total attempts made before giving up
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Settings for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers, at least one
    pub workers: usize,
    /// How long an idle worker waits for a wake signal before polling again
    pub idle_timeout: Duration,
    /// Pause after a store error other than an empty queue
    pub error_backoff: Duration,
    /// Capacity of the wake channel; extra notifications are dropped
    pub wake_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            idle_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(2),
            wake_buffer: 64,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}

/// Application configuration resolved from the command line
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub download: DownloadConfig,
    pub pool: PoolConfig,
    pub quiet: bool,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}

/// Base directory for the database and downloads when none is given
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podqueue")
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        if cli.workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }

        let data_dir = default_data_dir();
        let database = cli
            .db
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| data_dir.join("podqueue.db"));
        let download_dir = cli
            .download_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| data_dir.join("episodes"));

        let mut download = DownloadConfig::new(download_dir);
        download.retry_count = cli.retries;
        download.max_backoff = Duration::from_secs(cli.max_backoff);
        if download.max_backoff < download.base_backoff {
            download.base_backoff = download.max_backoff;
        }

        Ok(Self {
            database,
            download,
            pool: PoolConfig::with_workers(cli.workers),
            quiet: cli.quiet,
        })
    }
}
