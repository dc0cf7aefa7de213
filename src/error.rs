use std::path::PathBuf;

use thiserror::Error;

use crate::store::EpisodeState;

/// Errors raised by the episode and queue stores
#[derive(Error, Debug)]
pub enum StoreError {
    /// No pending queue entry exists. Not a failure: idle workers wait on it.
    #[error("Download queue is empty")]
    QueueEmpty,

    /// The database is busy or locked by another transaction
    #[error("Database is busy: {0}")]
    Contention(String),

    #[error("Episode '{0}' not found")]
    NotFound(String),

    #[error("Episode '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: EpisodeState,
        to: EpisodeState,
    },

    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[source] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StoreError {
    /// True for the transient busy/locked condition retried inside the store
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }

    pub fn is_queue_empty(&self) -> bool {
        matches!(self, StoreError::QueueEmpty)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Contention(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Errors raised while looking up an episode's downloadable metadata
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Episode '{0}' not found")]
    NotFound(String),

    #[error("Episode '{0}' has no enclosure URL")]
    NoEnclosure(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server resumed {url} at byte {actual}, expected {expected}")]
    RangeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Failed to open file {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to hash file {path}: {source}")]
    HashFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    InstallFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
