//! Fixed-size pool of download workers fed from the persistent queue.
//!
//! Each worker loops: claim the next queue entry, resolve its metadata,
//! hand it to the [`Downloader`], and requeue it on failure. Idle workers
//! sleep until [`Manager::notify`] is called or their idle timeout passes,
//! so enqueueing without notifying still gets picked up eventually.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::episode::{DownloadContext, Downloader};
use crate::error::{ResolveError, StoreError};
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::store::{DownloadResolver, QueueStore};

/// Handle to a running worker pool.
///
/// Dropping the handle cancels the workers without waiting for them; call
/// [`Manager::stop`] to wait for a clean exit.
pub struct Manager {
    cancel: CancellationToken,
    wake_tx: mpsc::Sender<()>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    busy: Arc<AtomicUsize>,
    workers: usize,
}

/// State shared by every worker of one pool
struct Worker<C> {
    queue: Arc<dyn QueueStore>,
    resolver: Arc<dyn DownloadResolver>,
    downloader: Arc<Downloader<C>>,
    reporter: SharedProgressReporter,
    config: PoolConfig,
    cancel: CancellationToken,
    wake_tx: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    busy: Arc<AtomicUsize>,
}

impl Manager {
    /// Spawn `config.workers` workers (at least one) on the current runtime.
    pub fn start<C: HttpClient + 'static>(
        config: PoolConfig,
        queue: Arc<dyn QueueStore>,
        resolver: Arc<dyn DownloadResolver>,
        downloader: Arc<Downloader<C>>,
        reporter: SharedProgressReporter,
    ) -> Self {
        let workers = config.workers.max(1);
        let (wake_tx, wake_rx) = mpsc::channel(config.wake_buffer.max(1));
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let busy = Arc::new(AtomicUsize::new(0));

        let shared = Arc::new(Worker {
            queue,
            resolver,
            downloader,
            reporter,
            config,
            cancel: cancel.clone(),
            wake_tx: wake_tx.clone(),
            wake_rx: tokio::sync::Mutex::new(wake_rx),
            in_flight: Arc::clone(&in_flight),
            busy: Arc::clone(&busy),
        });

        let handles = (0..workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { shared.run(worker_id).await })
            })
            .collect();

        tracing::debug!(workers, "Started download workers");

        Self {
            cancel,
            wake_tx,
            handles: tokio::sync::Mutex::new(handles),
            in_flight,
            busy,
            workers,
        }
    }

    /// Tell idle workers that new work may be available.
    ///
    /// Never blocks; when wake signals are already pending this one is
    /// dropped.
    pub fn notify(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Cancel the workers and wait for all of them to exit.
    ///
    /// Downloads stop at their next cancellation point; a transfer that is
    /// mid-stream finishes its current attempt first. Calling `stop` again
    /// is a no-op.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.notify();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Download worker panicked: {}", e);
            }
        }
    }

    /// Episode ids currently being processed, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = set.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Workers that are claiming or processing a task right now
    pub fn active_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Counts a worker as busy for as long as it lives
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps an episode id in the in-flight set for as long as it lives
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    episode_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn new(set: &'a Mutex<HashSet<String>>, episode_id: &str) -> Self {
        set.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(episode_id.to_string());
        Self {
            set,
            episode_id: episode_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.episode_id);
    }
}

impl<C: HttpClient + 'static> Worker<C> {
    async fn run(&self, worker_id: usize) {
        self.reporter
            .report(ProgressEvent::WorkerStarted { worker_id });
        tracing::debug!(worker = worker_id, "Worker started");

        while !self.cancel.is_cancelled() {
            let busy = BusyGuard::new(&self.busy);

            let episode_id = match self.queue.claim_next().await {
                Ok(id) => id,
                Err(e) if e.is_queue_empty() => {
                    drop(busy);
                    self.wait_for_wake().await;
                    continue;
                }
                Err(e) => {
                    drop(busy);
                    tracing::warn!(worker = worker_id, "Failed to claim next download: {}", e);
                    self.reporter.report(ProgressEvent::StoreError {
                        worker_id,
                        error: e.to_string(),
                    });
                    self.pause(self.config.error_backoff).await;
                    continue;
                }
            };

            // Let an idle sibling look for more work
            let _ = self.wake_tx.try_send(());

            self.reporter.report(ProgressEvent::TaskClaimed {
                worker_id,
                episode_id: episode_id.clone(),
            });

            let succeeded = {
                let _in_flight = InFlightGuard::new(&self.in_flight, &episode_id);
                self.process(worker_id, &episode_id).await
            };
            drop(busy);

            if !succeeded {
                self.pause(self.config.error_backoff).await;
            }
        }

        tracing::debug!(worker = worker_id, "Worker stopped");
        self.reporter
            .report(ProgressEvent::WorkerStopped { worker_id });
    }

    /// Resolve and download one claimed episode. Returns false when the
    /// worker should back off before claiming again.
    async fn process(&self, worker_id: usize, episode_id: &str) -> bool {
        let info = match self.resolver.resolve(episode_id).await {
            Ok(info) => info,
            Err(ResolveError::Store(e)) => {
                tracing::warn!(worker = worker_id, episode = %episode_id, "Failed to resolve episode: {}", e);
                self.reporter.report(ProgressEvent::StoreError {
                    worker_id,
                    error: e.to_string(),
                });
                self.requeue(worker_id, episode_id).await;
                return false;
            }
            Err(e) => {
                tracing::info!(worker = worker_id, episode = %episode_id, "Dropping queue entry: {}", e);
                self.reporter.report(ProgressEvent::EpisodeUnavailable {
                    worker_id,
                    episode_id: episode_id.to_string(),
                    reason: e.to_string(),
                });
                return true;
            }
        };

        let context = DownloadContext { worker_id };
        match self
            .downloader
            .download_episode(&info, &context, &self.cancel)
            .await
        {
            Ok(path) => {
                tracing::info!(
                    worker = worker_id,
                    episode = %episode_id,
                    path = %path.display(),
                    "Download finished"
                );
                true
            }
            Err(e) if e.is_cancelled() => {
                // Left QUEUED without an entry; recovered on next startup
                tracing::info!(worker = worker_id, episode = %episode_id, "Download cancelled");
                self.reporter.report(ProgressEvent::DownloadFailed {
                    worker_id,
                    episode_title: info.title.clone(),
                    error: e.to_string(),
                });
                true
            }
            Err(e) => {
                tracing::warn!(worker = worker_id, episode = %episode_id, "Download failed: {}", e);
                self.reporter.report(ProgressEvent::DownloadFailed {
                    worker_id,
                    episode_title: info.title.clone(),
                    error: e.to_string(),
                });
                self.requeue(worker_id, episode_id).await;
                false
            }
        }
    }

    async fn requeue(&self, worker_id: usize, episode_id: &str) {
        match self.queue.requeue(episode_id).await {
            Ok(()) => {
                tracing::debug!(worker = worker_id, episode = %episode_id, "Requeued episode");
                self.reporter.report(ProgressEvent::Requeued {
                    worker_id,
                    episode_id: episode_id.to_string(),
                });
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::info!(worker = worker_id, episode = %episode_id, state = %from, "Not requeueing episode that left the queue");
            }
            Err(e) => {
                tracing::error!(worker = worker_id, episode = %episode_id, "Failed to requeue episode: {}", e);
                self.reporter.report(ProgressEvent::StoreError {
                    worker_id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Sleep until woken, cancelled, or the idle timeout passes.
    ///
    /// Only one worker listens on the wake channel at a time; the others
    /// queue up on its lock and fall through on timeout or cancellation.
    async fn wait_for_wake(&self) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = async {
                let mut rx = self.wake_rx.lock().await;
                if rx.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            } => {}
            _ = tokio::time::sleep(self.config.idle_timeout) => {}
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::{EpisodeState, EpisodeStore, NewEpisode, SqliteStore};
    use crate::test_helpers::{
        BarrierClient, CollectingReporter, ConcurrencyProbe, GateClient, RecordingSleeper,
        Scripted, ScriptedClient, downloader, episode_url, eventually, queued_store,
        seeded_store, test_config,
    };
    use tempfile::tempdir;

    fn pool_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            idle_timeout: Duration::from_secs(3600),
            error_backoff: Duration::from_millis(10),
            wake_buffer: 8,
        }
    }

    fn start<C: HttpClient + 'static>(
        config: PoolConfig,
        store: &Arc<SqliteStore>,
        downloader: Downloader<C>,
        reporter: &Arc<CollectingReporter>,
    ) -> Manager {
        Manager::start(
            config,
            store.clone(),
            store.clone(),
            Arc::new(downloader),
            reporter.clone(),
        )
    }

    async fn state_of(store: &SqliteStore, id: &str) -> EpisodeState {
        store.get_episode(id).await.unwrap().unwrap().state
    }

    async fn has_state(store: &SqliteStore, id: &str, expected: EpisodeState) -> bool {
        state_of(store, id).await == expected
    }

    async fn all_downloaded(store: &SqliteStore, ids: &[&str]) -> bool {
        for id in ids {
            if state_of(store, id).await != EpisodeState::Downloaded {
                return false;
            }
        }
        true
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_workers_download_two_episodes_concurrently() {
        let dir = tempdir().unwrap();
        let store = queued_store(&["a", "b"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let client = BarrierClient::new(2, b"hello world");
        let dl = downloader(
            client,
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(2), &store, dl, &reporter);
        manager.notify();

        eventually(|| all_downloaded(&store, &["a", "b"])).await;
        assert!(store.list_queue().await.unwrap().is_empty());

        manager.stop().await;
        assert!(manager.in_flight().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_never_exceeds_worker_count() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let dir = tempdir().unwrap();
        let store = queued_store(&ids).await;
        let reporter = Arc::new(CollectingReporter::default());
        let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(200)));
        let dl = downloader(
            probe.clone(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(3), &store, dl, &reporter);
        manager.notify();

        eventually(|| all_downloaded(&store, &ids)).await;
        manager.stop().await;

        assert_eq!(probe.total(), ids.len());
        assert_eq!(probe.peak(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_download_is_requeued_and_others_continue() {
        let dir = tempdir().unwrap();
        let store = queued_store(&["bad", "good"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let client = ScriptedClient::new();
        client.push(&episode_url("good"), Scripted::ok(b"fine"));
        let dl = downloader(
            client,
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(1), &store, dl, &reporter);

        eventually(|| has_state(&store, "good", EpisodeState::Downloaded)).await;
        eventually(|| {
            let requeued = reporter.count(|e| {
                matches!(e, ProgressEvent::Requeued { episode_id, .. } if episode_id == "bad")
            });
            async move { requeued > 0 }
        })
        .await;
        manager.stop().await;

        let bad = store.get_episode("bad").await.unwrap().unwrap();
        assert_eq!(bad.state, EpisodeState::Queued);
        assert!(bad.retry_count >= 1);
        assert!(
            reporter.count(|e| matches!(e, ProgressEvent::DownloadFailed { .. })) >= 1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_episode_is_dropped_without_requeue() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&[]).await;
        store
            .upsert_episode(&NewEpisode {
                id: "silent".to_string(),
                podcast_id: "pod".to_string(),
                title: "No audio".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.enqueue("silent").await.unwrap();

        let reporter = Arc::new(CollectingReporter::default());
        let client = ScriptedClient::new();
        let dl = downloader(
            client.clone(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(1), &store, dl, &reporter);
        eventually(|| {
            let dropped = reporter.count(|e| matches!(e, ProgressEvent::EpisodeUnavailable { .. }));
            async move { dropped == 1 }
        })
        .await;
        manager.stop().await;

        assert!(store.list_queue().await.unwrap().is_empty());
        assert!(client.requests().is_empty());
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Requeued { .. })), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn notify_wakes_an_idle_worker() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&["late"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let client = ScriptedClient::new();
        client.push(&episode_url("late"), Scripted::ok(b"late audio"));
        let dl = downloader(
            client,
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        // Idle timeout is an hour, so only the wake signal can trigger a claim
        let manager = start(pool_config(2), &store, dl, &reporter);
        eventually(|| {
            let started = reporter.count(|e| matches!(e, ProgressEvent::WorkerStarted { .. }));
            async move { started == 2 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.enqueue("late").await.unwrap();
        manager.notify();

        eventually(|| has_state(&store, "late", EpisodeState::Downloaded)).await;
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_timeout_picks_up_work_without_notify() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&["quiet"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let client = ScriptedClient::new();
        client.push(&episode_url("quiet"), Scripted::ok(b"audio"));
        let dl = downloader(
            client,
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let mut config = pool_config(1);
        config.idle_timeout = Duration::from_millis(50);
        let manager = start(config, &store, dl, &reporter);

        store.enqueue("quiet").await.unwrap();
        eventually(|| has_state(&store, "quiet", EpisodeState::Downloaded)).await;
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_flight_lists_claimed_episodes() {
        let dir = tempdir().unwrap();
        let store = queued_store(&["slow"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let gate = Arc::new(GateClient::new(b"audio"));
        let dl = downloader(
            gate.clone(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(2), &store, dl, &reporter);
        eventually(|| {
            let claimed = manager.in_flight() == vec!["slow".to_string()];
            async move { claimed }
        })
        .await;
        assert!(store.list_queue().await.unwrap().is_empty());
        eventually(|| {
            let busy = manager.active_workers();
            async move { busy == 1 }
        })
        .await;

        gate.open(1);
        eventually(|| has_state(&store, "slow", EpisodeState::Downloaded)).await;
        eventually(|| {
            let idle = manager.in_flight().is_empty();
            async move { idle }
        })
        .await;
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_backoff_leaves_episode_for_recovery() {
        let dir = tempdir().unwrap();
        let store = queued_store(&["flaky"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let client = ScriptedClient::new();
        client.push(&episode_url("flaky"), Scripted::status(500));
        // Real sleeper: the first backoff lasts a full second
        let dl = Downloader::new(client, store.clone(), test_config(dir.path(), 3))
            .with_reporter(reporter.clone());

        let manager = start(pool_config(1), &store, dl, &reporter);
        eventually(|| {
            let scheduled = reporter.count(|e| matches!(e, ProgressEvent::RetryScheduled { .. }));
            async move { scheduled == 1 }
        })
        .await;

        tokio::time::timeout(Duration::from_millis(500), manager.stop())
            .await
            .expect("stop should interrupt the backoff");

        assert_eq!(state_of(&store, "flaky").await, EpisodeState::Queued);
        assert!(store.list_queue().await.unwrap().is_empty());
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Requeued { .. })), 0);

        assert_eq!(store.recover_orphans().await.unwrap(), 1);
        assert_eq!(store.list_queue().await.unwrap().len(), 1);
    }

    async fn fail_while_claimed<F, Fut>(leave_queue: F) -> (Arc<SqliteStore>, Arc<CollectingReporter>)
    where
        F: FnOnce(Arc<SqliteStore>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let dir = tempdir().unwrap();
        let store = queued_store(&["bad"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let gate = Arc::new(GateClient::failing(500));
        let dl = downloader(
            gate.clone(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(1), &store, dl, &reporter);
        eventually(|| {
            let claimed = manager.in_flight() == vec!["bad".to_string()];
            async move { claimed }
        })
        .await;

        leave_queue(store.clone()).await;
        gate.open(10);

        eventually(|| {
            let failed = reporter.count(|e| matches!(e, ProgressEvent::DownloadFailed { .. }));
            async move { failed >= 1 }
        })
        .await;
        eventually(|| {
            let idle = manager.active_workers() == 0;
            async move { idle }
        })
        .await;
        manager.stop().await;

        (store, reporter)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn episode_ignored_mid_transfer_is_not_requeued() {
        let (store, reporter) = fail_while_claimed(|store| async move {
            store.ignore("bad").await.unwrap();
        })
        .await;

        assert_eq!(state_of(&store, "bad").await, EpisodeState::Ignored);
        assert!(store.list_queue().await.unwrap().is_empty());
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Requeued { .. })), 0);
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::DownloadFailed { .. })), 1);
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::StoreError { .. })), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn episode_removed_mid_transfer_is_not_requeued() {
        let (store, reporter) = fail_while_claimed(|store| async move {
            store.remove("bad").await.unwrap();
        })
        .await;

        assert_eq!(state_of(&store, "bad").await, EpisodeState::Seen);
        assert!(store.list_queue().await.unwrap().is_empty());
        assert_eq!(reporter.count(|e| matches!(e, ProgressEvent::Requeued { .. })), 0);
        assert_eq!(store.recover_orphans().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn episode_ignored_mid_transfer_stays_ignored_after_success() {
        let dir = tempdir().unwrap();
        let store = queued_store(&["slow"]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let gate = Arc::new(GateClient::new(b"audio"));
        let dl = downloader(
            gate.clone(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(1), &store, dl, &reporter);
        eventually(|| {
            let claimed = manager.in_flight() == vec!["slow".to_string()];
            async move { claimed }
        })
        .await;
        store.ignore("slow").await.unwrap();
        gate.open(1);

        eventually(|| {
            let done = reporter.count(|e| matches!(e, ProgressEvent::DownloadCompleted { .. }));
            async move { done == 1 }
        })
        .await;
        manager.stop().await;

        let episode = store.get_episode("slow").await.unwrap().unwrap();
        assert_eq!(episode.state, EpisodeState::Ignored);
        assert!(episode.file_path.is_some());
        assert!(store.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = seeded_store(&[]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let dir = tempdir().unwrap();
        let dl = downloader(
            ScriptedClient::new(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(3), &store, dl, &reporter);
        for _ in 0..100 {
            manager.notify();
        }

        manager.stop().await;
        manager.stop().await;

        assert!(manager.is_stopped());
        assert_eq!(manager.workers(), 3);
        let stopped = reporter.count(|e| matches!(e, ProgressEvent::WorkerStopped { .. }));
        assert_eq!(stopped, 3);
        assert_eq!(
            reporter
                .events()
                .iter()
                .filter(|e| matches!(e, ProgressEvent::WorkerStarted { .. }))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn zero_workers_still_runs_one() {
        let store = seeded_store(&[]).await;
        let reporter = Arc::new(CollectingReporter::default());
        let dir = tempdir().unwrap();
        let dl = downloader(
            ScriptedClient::new(),
            store.clone(),
            test_config(dir.path(), 0),
            Arc::new(RecordingSleeper::default()),
            reporter.clone(),
        );

        let manager = start(pool_config(0), &store, dl, &reporter);
        assert_eq!(manager.workers(), 1);
        manager.stop().await;
    }
}
