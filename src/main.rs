use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use console::{Emoji, Term};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use podqueue::cli::{Cli, Command};
use podqueue::store::{NewEpisode, Podcast};
use podqueue::{
    Config, DownloadContext, Downloader, DownloadResolver, EpisodeStore, Manager, NoopReporter,
    ProgressEvent, ProgressReporter, QueueStore, ReqwestClient, SharedProgressReporter,
    SqliteStore, TracingReporter,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[r] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// How often `run` checks whether the queue has drained
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
    main_bar: ProgressBar,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(Duration::from_millis(100));
        main_bar.set_message(format!("{HEADPHONES}Waiting for downloads"));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn get_or_create_bar(&self, worker_id: usize) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bar) = bars.get(&worker_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(worker_id, bar.clone());
        bar
    }

    fn finish_bar(&self, worker_id: usize) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.remove(&worker_id) {
            bar.finish_and_clear();
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::WorkerStarted { .. } | ProgressEvent::WorkerStopped { .. } => {}

            ProgressEvent::TaskClaimed {
                worker_id,
                episode_id,
            } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}Worker {} picked up {}",
                    worker_id.to_string().cyan(),
                    episode_id.cyan()
                ));
            }

            ProgressEvent::EpisodeUnavailable {
                episode_id, reason, ..
            } => {
                self.println(format!(
                    "{FAILURE}{} {}",
                    episode_id.yellow(),
                    reason.dimmed()
                ));
            }

            ProgressEvent::AlreadyPresent {
                episode_title,
                path,
                ..
            } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.println(format!(
                    "{SUCCESS}{} {}",
                    truncate_title(&episode_title, 40).green(),
                    format!("(already at {})", path.display()).dimmed()
                ));
            }

            ProgressEvent::DownloadStarting {
                worker_id,
                episode_title,
                attempt,
                resume_from,
                content_length,
            } => {
                let bar = self.get_or_create_bar(worker_id);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(resume_from);
                let attempt_note = if attempt > 1 {
                    format!(" (attempt {attempt})").yellow().to_string()
                } else {
                    String::new()
                };
                bar.set_message(format!(
                    "{}{}",
                    truncate_title(&episode_title, 40),
                    attempt_note
                ));
            }

            ProgressEvent::DownloadProgress {
                worker_id,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(worker_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::HashingCompleted { .. } => {}

            ProgressEvent::RetryScheduled {
                worker_id,
                episode_title,
                delay,
                error,
                ..
            } => {
                let bar = self.get_or_create_bar(worker_id);
                bar.set_message(format!(
                    "{RETRY}{} - retrying in {}s: {}",
                    truncate_title(&episode_title, 30),
                    delay.as_secs(),
                    error.yellow()
                ));
            }

            ProgressEvent::DownloadCompleted {
                worker_id,
                episode_title,
                path,
                ..
            } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.finish_bar(worker_id);
                self.println(format!(
                    "{SUCCESS}{} {}",
                    truncate_title(&episode_title, 40).green(),
                    path.display().to_string().dimmed()
                ));
            }

            ProgressEvent::DownloadFailed {
                worker_id,
                episode_title,
                error,
            } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.finish_bar(worker_id);
                self.println(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
            }

            ProgressEvent::Requeued { episode_id, .. } => {
                self.main_bar
                    .set_message(format!("{RETRY}Requeued {}", episode_id.yellow()));
            }

            ProgressEvent::StoreError { worker_id, error } => {
                self.println(format!(
                    "{FAILURE}Worker {} store error: {}",
                    worker_id,
                    error.red()
                ));
            }
        }
    }
}

/// Remembers which episodes failed during this run so that `run` can stop
/// once only those are left in the queue.
struct FailureTracker {
    inner: SharedProgressReporter,
    requeued: Mutex<HashSet<String>>,
}

impl FailureTracker {
    fn new(inner: SharedProgressReporter) -> Self {
        Self {
            inner,
            requeued: Mutex::new(HashSet::new()),
        }
    }

    fn failed_this_run(&self, episode_id: &str) -> bool {
        self.requeued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(episode_id)
    }
}

impl ProgressReporter for FailureTracker {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::Requeued { episode_id, .. } = &event {
            self.requeued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(episode_id.clone());
        }
        self.inner.report(event);
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let head: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn init_tracing(cli: &Cli) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();
}

/// Terminal renderer unless quiet or not attached to a terminal
fn make_reporter(config: &Config) -> (SharedProgressReporter, Option<Arc<IndicatifReporter>>) {
    if config.quiet {
        (NoopReporter::shared(), None)
    } else if Term::stderr().is_term() {
        let reporter = Arc::new(IndicatifReporter::new());
        (reporter.clone(), Some(reporter))
    } else {
        (TracingReporter::shared(), None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::from_cli(&cli)?;

    if let Some(parent) = config.database.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create database directory {}", parent.display())
        })?;
    }
    let store = Arc::new(
        SqliteStore::open(&config.database)
            .await
            .with_context(|| format!("Failed to open {}", config.database.display()))?,
    );

    match cli.command {
        Command::AddPodcast {
            id,
            title,
            feed_url,
        } => {
            store
                .upsert_podcast(&Podcast {
                    id: id.clone(),
                    title: title.clone(),
                    feed_url,
                })
                .await
                .context("Failed to add podcast")?;
            println!("{SUCCESS}Added podcast {} ({})", title.bold(), id.dimmed());
        }

        Command::AddEpisode {
            id,
            podcast,
            title,
            url,
            description,
        } => {
            url::Url::parse(&url).with_context(|| format!("Invalid enclosure URL '{url}'"))?;
            store
                .upsert_episode(&NewEpisode {
                    id: id.clone(),
                    podcast_id: podcast,
                    title: title.clone(),
                    description,
                    enclosure_url: Some(url),
                    ..Default::default()
                })
                .await
                .context("Failed to add episode")?;
            println!("{SUCCESS}Added episode {} ({})", title.bold(), id.dimmed());
        }

        Command::Enqueue { id, priority } => {
            store
                .enqueue_with_priority(&id, priority)
                .await
                .with_context(|| format!("Failed to enqueue '{id}'"))?;
            println!("{DOWNLOAD}Queued {}", id.cyan());
        }

        Command::Remove { id } => {
            store
                .remove(&id)
                .await
                .with_context(|| format!("Failed to remove '{id}'"))?;
            println!("Removed {} from the queue", id.cyan());
        }

        Command::Requeue { id } => {
            store
                .requeue(&id)
                .await
                .with_context(|| format!("Failed to requeue '{id}'"))?;
            println!("{RETRY}Requeued {}", id.cyan());
        }

        Command::Ignore { id } => {
            store
                .ignore(&id)
                .await
                .with_context(|| format!("Failed to ignore '{id}'"))?;
            println!("Ignoring {}", id.cyan());
        }

        Command::Unignore { id } => {
            store
                .unignore(&id)
                .await
                .with_context(|| format!("Failed to unignore '{id}'"))?;
            println!("No longer ignoring {}", id.cyan());
        }

        Command::Queue { json } => show_queue(&store, json).await?,

        Command::Episodes { state, json } => {
            let episodes = store
                .list_episodes(state)
                .await
                .context("Failed to list episodes")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&episodes)?);
            } else if episodes.is_empty() {
                println!("{}", "No episodes".dimmed());
            } else {
                for episode in &episodes {
                    println!(
                        "{:<10} {:<24} {}",
                        episode.state.to_string().cyan(),
                        episode.id,
                        truncate_title(&episode.title, 50)
                    );
                }
            }
        }

        Command::Download { id } => download_one(&config, store, &id).await?,

        Command::Run { watch } => run_pool(&config, store, watch).await?,
    }

    Ok(())
}

async fn show_queue(store: &SqliteStore, json: bool) -> Result<()> {
    let entries = store.list_queue().await.context("Failed to read queue")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", "Queue is empty".dimmed());
        return Ok(());
    }

    for entry in &entries {
        let title = store
            .get_episode(&entry.episode_id)
            .await?
            .map(|episode| episode.title)
            .unwrap_or_default();
        println!(
            "{:>4}  {}  {:<24} {}",
            entry.priority,
            entry.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            entry.episode_id.cyan(),
            truncate_title(&title, 50)
        );
    }
    Ok(())
}

/// Download one episode in the foreground, surfacing the final error.
async fn download_one(config: &Config, store: Arc<SqliteStore>, id: &str) -> Result<()> {
    let info = store
        .resolve(id)
        .await
        .with_context(|| format!("Cannot download '{id}'"))?;

    let (reporter, renderer) = make_reporter(config);
    let cancel = podqueue::shutdown::install_signal_handler()
        .context("Failed to install signal handler")?;

    let downloader = Downloader::new(ReqwestClient::new(), store, config.download.clone())
        .with_reporter(reporter);
    let result = downloader
        .download_episode(&info, &DownloadContext::default(), &cancel)
        .await;

    if let Some(renderer) = &renderer {
        renderer.finish();
    }
    let path = result.with_context(|| format!("Failed to download '{}'", info.title))?;

    if !config.quiet {
        println!("{FOLDER}{}", path.display());
    }
    Ok(())
}

/// Start the worker pool and wait until the queue drains (or forever with
/// `watch`), stopping early on Ctrl+C.
async fn run_pool(config: &Config, store: Arc<SqliteStore>, watch: bool) -> Result<()> {
    let recovered = store
        .recover_orphans()
        .await
        .context("Failed to recover interrupted downloads")?;
    let missing = store
        .reconcile_files()
        .await
        .context("Failed to check downloaded files")?;

    if !config.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podqueue".bold().magenta(),
            "- Episode downloads".dimmed()
        );
        if recovered > 0 {
            println!("{RETRY}Resuming {} interrupted download(s)", recovered);
        }
        if !missing.is_empty() {
            println!(
                "{FAILURE}{} downloaded file(s) no longer on disk",
                missing.len().to_string().yellow()
            );
        }
    }

    let (reporter, renderer) = make_reporter(config);
    let tracker = Arc::new(FailureTracker::new(reporter));
    let cancel = podqueue::shutdown::install_signal_handler()
        .context("Failed to install signal handler")?;

    let downloader = Arc::new(
        Downloader::new(ReqwestClient::new(), store.clone(), config.download.clone())
            .with_reporter(tracker.clone()),
    );
    let manager = Manager::start(
        config.pool.clone(),
        store.clone(),
        store.clone(),
        downloader,
        tracker.clone(),
    );
    manager.notify();

    let mut left_over = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
        }

        if watch {
            continue;
        }
        let pending = store.list_queue().await.context("Failed to read queue")?;
        let drained = pending
            .iter()
            .all(|entry| tracker.failed_this_run(&entry.episode_id));
        if drained && manager.active_workers() == 0 {
            left_over = pending.len();
            break;
        }
    }

    manager.stop().await;

    if let Some(renderer) = renderer {
        renderer.finish();
        let completed = renderer.completed.load(Ordering::Relaxed);
        let failed = renderer.failed.load(Ordering::Relaxed);
        println!(
            "\n{PARTY}{} {} downloaded, {} failed",
            "Done:".bold().green(),
            completed.to_string().green().bold(),
            if failed > 0 {
                failed.to_string().red().bold()
            } else {
                failed.to_string().green()
            }
        );
    }
    if left_over > 0 && !config.quiet {
        println!(
            "{RETRY}{} episode(s) failed and remain queued; run again to retry",
            left_over.to_string().yellow()
        );
    }

    Ok(())
}
