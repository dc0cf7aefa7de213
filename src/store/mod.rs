//! Persistent episode state and the download queue.
//!
//! Both live in one SQLite database so that queue changes and episode
//! lifecycle changes commit in the same transaction. Callers depend on the
//! traits below rather than on [`SqliteStore`] so that another backend can
//! substitute its own notion of transient contention.

mod schema;
mod sqlite;
mod types;

use async_trait::async_trait;

use crate::error::{ResolveError, StoreError};

pub use sqlite::SqliteStore;
pub use types::{
    CompletedDownload, DownloadInfo, Episode, EpisodeState, NewEpisode, ParseStateError,
    Podcast, QueueEntry,
};

/// Episode lifecycle operations.
///
/// The store is the only component allowed to mutate state, hash, path and
/// retry counter; the transfer engine and worker pool request changes here.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// Insert or refresh a podcast.
    async fn upsert_podcast(&self, podcast: &Podcast) -> Result<(), StoreError>;

    /// Insert a new episode in state `NEW`, or refresh the feed-side columns
    /// of an existing one without touching its lifecycle columns.
    async fn upsert_episode(&self, episode: &NewEpisode) -> Result<(), StoreError>;

    async fn get_episode(&self, id: &str) -> Result<Option<Episode>, StoreError>;

    /// List episodes, newest first, optionally filtered by state.
    async fn list_episodes(
        &self,
        state: Option<EpisodeState>,
    ) -> Result<Vec<Episode>, StoreError>;

    /// `NEW` → `SEEN`. Any other state is left unchanged.
    async fn mark_seen(&self, id: &str) -> Result<(), StoreError>;

    /// Move an episode to `IGNORED`, dropping its pending queue entry.
    async fn ignore(&self, id: &str) -> Result<(), StoreError>;

    /// `IGNORED` → `SEEN`.
    async fn unignore(&self, id: &str) -> Result<(), StoreError>;

    /// Record one failed download attempt. Returns the new counter value.
    async fn increment_retry(&self, id: &str) -> Result<u32, StoreError>;

    /// Record a successful download and drop the episode's queue entry.
    ///
    /// An `IGNORED` episode keeps its state.
    async fn mark_downloaded(
        &self,
        id: &str,
        completed: &CompletedDownload,
    ) -> Result<(), StoreError>;

    /// Give every `QUEUED` episode without a queue entry a fresh one.
    ///
    /// Claims are consumed on pickup, so a process killed mid-transfer
    /// leaves its episode `QUEUED` with no entry. Returns the number of
    /// entries recreated.
    async fn recover_orphans(&self) -> Result<usize, StoreError>;

    /// Mark `DOWNLOADED` episodes whose file has disappeared as `DELETED`.
    /// Returns the affected episode ids.
    async fn reconcile_files(&self) -> Result<Vec<String>, StoreError>;
}

/// Durable, exclusive task queue
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Fresh start: state `QUEUED`, retry counter 0, entry with priority 0.
    async fn enqueue(&self, episode_id: &str) -> Result<(), StoreError> {
        self.enqueue_with_priority(episode_id, 0).await
    }

    async fn enqueue_with_priority(
        &self,
        episode_id: &str,
        priority: i64,
    ) -> Result<(), StoreError>;

    /// Atomically take the highest-priority, oldest entry off the queue.
    ///
    /// Returns [`StoreError::QueueEmpty`] when nothing is pending.
    async fn claim_next(&self) -> Result<String, StoreError>;

    /// Drop an entry. Absent entries are not an error.
    async fn remove(&self, episode_id: &str) -> Result<(), StoreError>;

    /// Put an entry back after a failed attempt, keeping its retry counter.
    ///
    /// Only `QUEUED` episodes are put back; an episode ignored or removed
    /// while in flight fails with [`StoreError::InvalidTransition`].
    async fn requeue(&self, episode_id: &str) -> Result<(), StoreError>;

    /// Pending entries in claim order.
    async fn list_queue(&self) -> Result<Vec<QueueEntry>, StoreError>;
}

/// Convenience bound for backends providing both halves
pub trait Store: EpisodeStore + QueueStore {}

impl<T: EpisodeStore + QueueStore + ?Sized> Store for T {}

/// Looks up an episode's downloadable metadata
#[async_trait]
pub trait DownloadResolver: Send + Sync {
    async fn resolve(&self, episode_id: &str) -> Result<DownloadInfo, ResolveError>;
}
