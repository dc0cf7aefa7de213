//! Shared fakes for the store, transport, sleeper and reporter.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::episode::Downloader;
use crate::http::{ByteStream, HttpClient, HttpResponse};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::sleep::Sleeper;
use crate::store::{EpisodeStore, NewEpisode, Podcast, QueueStore, SqliteStore};

pub(crate) const BASE_URL: &str = "https://cdn.example.com";

pub(crate) fn episode_url(id: &str) -> String {
    format!("{BASE_URL}/{id}.mp3")
}

/// In-memory store with podcast "pod" and one episode per id, nothing queued.
pub(crate) async fn seeded_store(ids: &[&str]) -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .upsert_podcast(&Podcast {
            id: "pod".to_string(),
            title: "The Show".to_string(),
            feed_url: None,
        })
        .await
        .unwrap();
    for id in ids {
        store
            .upsert_episode(&NewEpisode {
                id: id.to_string(),
                podcast_id: "pod".to_string(),
                title: format!("Episode {id}"),
                enclosure_url: Some(episode_url(id)),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    Arc::new(store)
}

/// Same as [`seeded_store`] with every episode enqueued in order.
pub(crate) async fn queued_store(ids: &[&str]) -> Arc<SqliteStore> {
    let store = seeded_store(ids).await;
    for id in ids {
        store.enqueue(id).await.unwrap();
    }
    store
}

pub(crate) fn test_config(download_dir: &Path, retry_count: u32) -> DownloadConfig {
    let mut config = DownloadConfig::new(download_dir);
    config.retry_count = retry_count;
    config
}

pub(crate) fn downloader<C: HttpClient>(
    client: C,
    store: Arc<SqliteStore>,
    config: DownloadConfig,
    sleeper: Arc<dyn Sleeper>,
    reporter: Arc<dyn ProgressReporter>,
) -> Downloader<C> {
    Downloader::new(client, store, config)
        .with_sleeper(sleeper)
        .with_reporter(reporter)
}

/// Records requested delays and returns immediately
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Cancels the token when asked to sleep, then never wakes
pub(crate) struct CancellingSleeper {
    pub(crate) token: CancellationToken,
}

#[async_trait]
impl Sleeper for CancellingSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.token.cancel();
        std::future::pending::<()>().await;
    }
}

/// Collects every event for later assertions
#[derive(Default)]
pub(crate) struct CollectingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingReporter {
    pub(crate) fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&ProgressEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl ProgressReporter for CollectingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// One canned response
#[derive(Clone)]
pub(crate) struct Scripted {
    status: u16,
    body: Vec<u8>,
    content_range_start: Option<u64>,
    complete_length: Option<u64>,
}

impl Scripted {
    pub(crate) fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            body: body.to_vec(),
            content_range_start: None,
            complete_length: None,
        }
    }

    pub(crate) fn partial(start: u64, body: &[u8]) -> Self {
        Self {
            status: 206,
            body: body.to_vec(),
            content_range_start: Some(start),
            complete_length: None,
        }
    }

    /// 416 announcing the complete length as `bytes */<total>`
    pub(crate) fn unsatisfiable(total: u64) -> Self {
        Self {
            status: 416,
            body: Vec::new(),
            content_range_start: None,
            complete_length: Some(total),
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_range_start: None,
            complete_length: None,
        }
    }
}

fn respond(scripted: Scripted) -> HttpResponse {
    let len = scripted.body.len() as u64;
    let body = Bytes::from(scripted.body);
    let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(body) }));
    HttpResponse {
        status: scripted.status,
        content_length: Some(len),
        content_range_start: scripted.content_range_start,
        complete_length: scripted.complete_length,
        body: stream,
    }
}

/// Plays back per-URL scripts and records every request.
///
/// A URL whose script has run out answers 404.
#[derive(Clone, Default)]
pub(crate) struct ScriptedClient {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Scripted>>>>,
    requests: Arc<Mutex<Vec<(String, Option<u64>)>>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, url: &str, response: Scripted) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// `(url, range_start)` of every request so far
    pub(crate) fn requests(&self) -> Vec<(String, Option<u64>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn get_stream(
        &self,
        url: &str,
        range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), range_start));
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| Scripted::status(404));
        Ok(respond(next))
    }
}

/// Holds every request at a barrier until `parties` requests are waiting,
/// then answers each with `body`.
pub(crate) struct BarrierClient {
    barrier: Barrier,
    body: Vec<u8>,
}

impl BarrierClient {
    pub(crate) fn new(parties: usize, body: &[u8]) -> Self {
        Self {
            barrier: Barrier::new(parties),
            body: body.to_vec(),
        }
    }
}

#[async_trait]
impl HttpClient for BarrierClient {
    async fn get_stream(
        &self,
        _url: &str,
        _range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error> {
        self.barrier.wait().await;
        Ok(respond(Scripted::ok(&self.body)))
    }
}

/// Tracks how many requests are open at once; each one lasts `hold`.
pub(crate) struct ConcurrencyProbe {
    hold: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    pub(crate) fn new(hold: Duration) -> Self {
        Self {
            hold,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for Arc<ConcurrencyProbe> {
    async fn get_stream(
        &self,
        _url: &str,
        _range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(respond(Scripted::ok(b"payload")))
    }
}

/// Holds every request until [`GateClient::open`] releases it.
pub(crate) struct GateClient {
    permits: tokio::sync::Semaphore,
    response: Scripted,
}

impl GateClient {
    pub(crate) fn new(body: &[u8]) -> Self {
        Self {
            permits: tokio::sync::Semaphore::new(0),
            response: Scripted::ok(body),
        }
    }

    /// Answers every released request with `status`
    pub(crate) fn failing(status: u16) -> Self {
        Self {
            permits: tokio::sync::Semaphore::new(0),
            response: Scripted::status(status),
        }
    }

    pub(crate) fn open(&self, requests: usize) {
        self.permits.add_permits(requests);
    }
}

#[async_trait]
impl HttpClient for Arc<GateClient> {
    async fn get_stream(
        &self,
        _url: &str,
        _range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error> {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        Ok(respond(self.response.clone()))
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within five seconds");
}
