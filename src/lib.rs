pub mod cli;
pub mod config;
pub mod episode;
pub mod error;
pub mod http;
pub mod progress;
pub mod shutdown;
pub mod sleep;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_helpers;

// Re-export main types for convenience
pub use config::{Config, DownloadConfig, PoolConfig};
pub use episode::{DownloadContext, Downloader};
pub use error::{DownloadError, ResolveError, StoreError};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use progress::{
    NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter, TracingReporter,
};
pub use sleep::{SharedSleeper, Sleeper, TokioSleeper};
pub use store::{
    DownloadInfo, DownloadResolver, Episode, EpisodeState, EpisodeStore, QueueStore, SqliteStore,
    Store,
};
pub use worker::Manager;
