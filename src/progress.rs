use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by the worker pool and transfer engine for progress reporting
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A worker entered its loop
    WorkerStarted { worker_id: usize },

    /// A worker left its loop after cancellation
    WorkerStopped { worker_id: usize },

    /// A worker took an episode off the queue
    TaskClaimed {
        worker_id: usize,
        episode_id: String,
    },

    /// A claimed episode vanished or has nothing to download; it is dropped
    EpisodeUnavailable {
        worker_id: usize,
        episode_id: String,
        reason: String,
    },

    /// The final file already holds the expected content
    AlreadyPresent {
        worker_id: usize,
        episode_title: String,
        path: PathBuf,
    },

    /// A download attempt is starting
    DownloadStarting {
        worker_id: usize,
        episode_title: String,
        /// 1-based attempt number
        attempt: u32,
        /// Bytes already on disk that the server agreed to skip
        resume_from: u64,
        /// Expected total size in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        worker_id: usize,
        episode_title: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// Hashing completed for a download
    HashingCompleted {
        worker_id: usize,
        episode_title: String,
        hash: String,
    },

    /// An attempt failed and another one follows after `delay`
    RetryScheduled {
        worker_id: usize,
        episode_title: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },

    /// A download completed successfully
    DownloadCompleted {
        worker_id: usize,
        episode_title: String,
        bytes_downloaded: u64,
        path: PathBuf,
    },

    /// A download failed for good (retries exhausted or cancelled)
    DownloadFailed {
        worker_id: usize,
        episode_title: String,
        error: String,
    },

    /// A failed episode was put back on the queue
    Requeued {
        worker_id: usize,
        episode_id: String,
    },

    /// The store rejected an operation; the worker keeps running
    StoreError { worker_id: usize, error: String },
}

/// Trait for reporting progress events.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect events in tests.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Forwards events to `tracing` at debug level, for runs without a terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::DownloadProgress { .. } => {}
            ProgressEvent::DownloadFailed {
                worker_id,
                episode_title,
                error,
            } => {
                tracing::warn!(worker = worker_id, episode = %episode_title, "Download failed: {error}");
            }
            ProgressEvent::StoreError { worker_id, error } => {
                tracing::warn!(worker = worker_id, "Store error: {error}");
            }
            other => tracing::debug!(?other, "progress"),
        }
    }
}

impl TracingReporter {
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
