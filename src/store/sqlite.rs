//! SQLite implementation of the episode store, queue store and resolver.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::schema;
use super::types::{
    CompletedDownload, DownloadInfo, Episode, EpisodeState, NewEpisode, Podcast, QueueEntry,
};
use super::{DownloadResolver, EpisodeStore, QueueStore};
use crate::error::{ResolveError, StoreError};

/// Attempts made for an operation that keeps hitting a busy database
const CONTENTION_ATTEMPTS: u32 = 5;

/// First contention backoff; doubles on every further attempt
const CONTENTION_BASE_DELAY: Duration = Duration::from_millis(50);

const EPISODE_COLUMNS: &str = "id, podcast_id, title, description, enclosure_url, state, \
     file_path, hash, retry_count, size_bytes, published_at, downloaded_at";

/// SQLite-backed store shared by every worker.
///
/// The connection sits behind a mutex and every operation runs on the
/// blocking thread pool, so workers never hold it across network or file
/// I/O. Busy timeouts are disabled: contention surfaces immediately as
/// [`StoreError::Contention`] and is retried here with backoff.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;
            conn.busy_timeout(Duration::ZERO)
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened episode database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the connection on the blocking pool, retrying with
    /// exponential backoff while the database reports contention.
    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut delay = CONTENTION_BASE_DELAY;
        let mut attempt = 1;

        loop {
            let conn = Arc::clone(&self.conn);
            let op = Arc::clone(&op);

            let result = tokio::task::spawn_blocking(move || {
                let mut conn = conn
                    .lock()
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                op(&mut conn)
            })
            .await?;

            match result {
                Err(e) if e.is_contention() && attempt < CONTENTION_ATTEMPTS => {
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Database busy, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn load_state(conn: &Connection, id: &str) -> Result<EpisodeState, StoreError> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM episodes WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;

    let state = state.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    state
        .parse::<EpisodeState>()
        .map_err(|e| StoreError::Query(e.to_string()))
}

fn row_to_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let state: String = row.get(5)?;
    let state = state
        .parse::<EpisodeState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Episode {
        id: row.get(0)?,
        podcast_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        enclosure_url: row.get(4)?,
        state,
        file_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        hash: row.get(7)?,
        retry_count: row.get::<_, i64>(8)? as u32,
        size_bytes: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        published_at: from_unix(row.get(10)?),
        downloaded_at: from_unix(row.get(11)?),
    })
}

#[async_trait]
impl EpisodeStore for SqliteStore {
    async fn upsert_podcast(&self, podcast: &Podcast) -> Result<(), StoreError> {
        let podcast = podcast.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO podcasts (id, title, feed_url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     title = excluded.title,
                     feed_url = COALESCE(excluded.feed_url, podcasts.feed_url)",
                params![podcast.id, podcast.title, podcast.feed_url],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_episode(&self, episode: &NewEpisode) -> Result<(), StoreError> {
        let episode = episode.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO episodes
                     (id, podcast_id, title, description, enclosure_url, state, size_bytes, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     podcast_id = excluded.podcast_id,
                     title = excluded.title,
                     description = excluded.description,
                     enclosure_url = excluded.enclosure_url,
                     size_bytes = COALESCE(excluded.size_bytes, episodes.size_bytes),
                     published_at = excluded.published_at",
                params![
                    episode.id,
                    episode.podcast_id,
                    episode.title,
                    episode.description,
                    episode.enclosure_url,
                    EpisodeState::New.as_str(),
                    episode.size_bytes.map(|v| v as i64),
                    episode.published_at.map(|dt| dt.timestamp()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_episode(&self, id: &str) -> Result<Option<Episode>, StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let episode = conn
                .query_row(
                    &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1"),
                    [&id],
                    row_to_episode,
                )
                .optional()?;
            Ok(episode)
        })
        .await
    }

    async fn list_episodes(
        &self,
        state: Option<EpisodeState>,
    ) -> Result<Vec<Episode>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EPISODE_COLUMNS} FROM episodes
                 WHERE ?1 IS NULL OR state = ?1
                 ORDER BY published_at IS NULL, published_at DESC, id"
            ))?;
            let episodes = stmt
                .query_map([state.map(|s| s.as_str())], row_to_episode)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(episodes)
        })
        .await
    }

    async fn mark_seen(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if load_state(&tx, &id)? == EpisodeState::New {
                tx.execute(
                    "UPDATE episodes SET state = ?1 WHERE id = ?2",
                    params![EpisodeState::Seen.as_str(), id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn ignore(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &id)?;
            let dropped = tx.execute("DELETE FROM downloads WHERE episode_id = ?1", [&id])?;
            tx.execute(
                "UPDATE episodes SET state = ?1 WHERE id = ?2",
                params![EpisodeState::Ignored.as_str(), id],
            )?;
            tx.commit()?;

            if dropped > 0 {
                tracing::debug!(episode = %id, from = %state, "Dropped pending download of ignored episode");
            }
            Ok(())
        })
        .await
    }

    async fn unignore(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &id)?;
            if state != EpisodeState::Ignored {
                return Err(StoreError::InvalidTransition {
                    id: id.clone(),
                    from: state,
                    to: EpisodeState::Seen,
                });
            }
            tx.execute(
                "UPDATE episodes SET state = ?1 WHERE id = ?2",
                params![EpisodeState::Seen.as_str(), id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "UPDATE episodes SET retry_count = retry_count + 1 WHERE id = ?1
                     RETURNING retry_count",
                    [&id],
                    |row| row.get(0),
                )
                .optional()?;
            count
                .map(|c| c as u32)
                .ok_or_else(|| StoreError::NotFound(id.clone()))
        })
        .await
    }

    async fn mark_downloaded(
        &self,
        id: &str,
        completed: &CompletedDownload,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let completed = completed.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // An ignored episode keeps its state; the file is still recorded
            let updated = tx.execute(
                "UPDATE episodes SET
                     state = CASE WHEN state = ?7 THEN state ELSE ?1 END,
                     file_path = ?2,
                     hash = ?3,
                     size_bytes = ?4,
                     downloaded_at = ?5,
                     retry_count = 0
                 WHERE id = ?6",
                params![
                    EpisodeState::Downloaded.as_str(),
                    completed.path.to_string_lossy(),
                    completed.hash,
                    completed.size_bytes as i64,
                    Utc::now().timestamp(),
                    id,
                    EpisodeState::Ignored.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(id.clone()));
            }
            tx.execute("DELETE FROM downloads WHERE episode_id = ?1", [&id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let recovered = self
            .call(|conn| {
                let count = conn.execute(
                    "INSERT INTO downloads (episode_id, enqueued_at, priority)
                     SELECT id, ?1, 0 FROM episodes
                     WHERE state = ?2 AND id NOT IN (SELECT episode_id FROM downloads)",
                    params![now_millis(), EpisodeState::Queued.as_str()],
                )?;
                Ok(count)
            })
            .await?;

        if recovered > 0 {
            tracing::info!(count = recovered, "Re-queued episodes left over from an interrupted run");
        }
        Ok(recovered)
    }

    async fn reconcile_files(&self) -> Result<Vec<String>, StoreError> {
        let downloaded: Vec<(String, Option<String>)> = self
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, file_path FROM episodes WHERE state = ?1")?;
                let rows = stmt
                    .query_map([EpisodeState::Downloaded.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut missing = Vec::new();
        for (id, file_path) in downloaded {
            let Some(file_path) = file_path else {
                missing.push(id);
                continue;
            };
            match tokio::fs::try_exists(&file_path).await {
                Ok(true) => {}
                Ok(false) => missing.push(id),
                Err(e) => {
                    tracing::warn!(
                        episode = %id,
                        path = %file_path,
                        error = %e,
                        "Failed to check downloaded file, leaving state unchanged"
                    );
                }
            }
        }

        if missing.is_empty() {
            return Ok(missing);
        }

        let ids = missing.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for id in &ids {
                tx.execute(
                    "UPDATE episodes SET state = ?1 WHERE id = ?2 AND state = ?3",
                    params![
                        EpisodeState::Deleted.as_str(),
                        id,
                        EpisodeState::Downloaded.as_str()
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::info!(count = missing.len(), "Marked episodes with missing files as deleted");
        Ok(missing)
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn enqueue_with_priority(
        &self,
        episode_id: &str,
        priority: i64,
    ) -> Result<(), StoreError> {
        let id = episode_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &id)?;
            if !state.can_enqueue() {
                return Err(StoreError::InvalidTransition {
                    id: id.clone(),
                    from: state,
                    to: EpisodeState::Queued,
                });
            }
            tx.execute(
                "UPDATE episodes SET state = ?1, retry_count = 0 WHERE id = ?2",
                params![EpisodeState::Queued.as_str(), id],
            )?;
            tx.execute(
                "INSERT INTO downloads (episode_id, enqueued_at, priority) VALUES (?1, ?2, ?3)
                 ON CONFLICT(episode_id) DO UPDATE SET
                     enqueued_at = excluded.enqueued_at,
                     priority = excluded.priority",
                params![id, now_millis(), priority],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn claim_next(&self) -> Result<String, StoreError> {
        self.call(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next: Option<String> = tx
                .query_row(
                    "SELECT episode_id FROM downloads
                     ORDER BY priority DESC, enqueued_at ASC, rowid ASC
                     LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else {
                return Err(StoreError::QueueEmpty);
            };

            tx.execute("DELETE FROM downloads WHERE episode_id = ?1", [&id])?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn remove(&self, episode_id: &str) -> Result<(), StoreError> {
        let id = episode_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM downloads WHERE episode_id = ?1", [&id])?;
            // Otherwise recover_orphans would put it straight back
            tx.execute(
                "UPDATE episodes SET state = ?1 WHERE id = ?2 AND state = ?3",
                params![
                    EpisodeState::Seen.as_str(),
                    id,
                    EpisodeState::Queued.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn requeue(&self, episode_id: &str) -> Result<(), StoreError> {
        let id = episode_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Ignored or removed while in flight
            let state = load_state(&tx, &id)?;
            if state != EpisodeState::Queued {
                return Err(StoreError::InvalidTransition {
                    id: id.clone(),
                    from: state,
                    to: EpisodeState::Queued,
                });
            }
            tx.execute(
                "INSERT INTO downloads (episode_id, enqueued_at, priority) VALUES (?1, ?2, 0)
                 ON CONFLICT(episode_id) DO UPDATE SET enqueued_at = excluded.enqueued_at",
                params![id, now_millis()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_queue(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT episode_id, enqueued_at, priority FROM downloads
                 ORDER BY priority DESC, enqueued_at ASC, rowid ASC",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(QueueEntry {
                        episode_id: row.get(0)?,
                        enqueued_at: DateTime::from_timestamp_millis(row.get(1)?)
                            .unwrap_or_default(),
                        priority: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

#[async_trait]
impl DownloadResolver for SqliteStore {
    async fn resolve(&self, episode_id: &str) -> Result<DownloadInfo, ResolveError> {
        let id = episode_id.to_string();
        let row = self
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT e.title, COALESCE(p.title, e.podcast_id), e.enclosure_url, e.hash
                         FROM episodes e LEFT JOIN podcasts p ON p.id = e.podcast_id
                         WHERE e.id = ?1",
                        [&id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, Option<String>>(2)?,
                                row.get::<_, Option<String>>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((title, podcast_title, enclosure_url, hash)) = row else {
            return Err(ResolveError::NotFound(episode_id.to_string()));
        };

        let enclosure_url = enclosure_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ResolveError::NoEnclosure(episode_id.to_string()))?;

        Ok(DownloadInfo {
            episode_id: episode_id.to_string(),
            title,
            podcast_title,
            enclosure_url,
            hash,
        })
    }
}
