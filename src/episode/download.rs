use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::filename::{final_path, partial_path};
use super::install::{existing_hash, hash_file, install_file};
use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};
use crate::sleep::{SharedSleeper, TokioSleeper};
use crate::store::{CompletedDownload, DownloadInfo, EpisodeStore};

/// Identifies who is running a download, for progress reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadContext {
    /// Worker slot (0 to workers-1) for progress bar management
    pub worker_id: usize,
}

/// Resumable, retried, hash-verified episode downloads.
///
/// Partial data survives failed attempts and process restarts under
/// `<download_dir>/.partial/`, and each new attempt asks the server for the
/// remaining bytes only. Results and retry counters go through the
/// [`EpisodeStore`].
pub struct Downloader<C> {
    client: C,
    store: Arc<dyn EpisodeStore>,
    config: DownloadConfig,
    sleeper: SharedSleeper,
    reporter: SharedProgressReporter,
}

impl<C: HttpClient> Downloader<C> {
    pub fn new(client: C, store: Arc<dyn EpisodeStore>, config: DownloadConfig) -> Self {
        Self {
            client,
            store,
            config,
            sleeper: TokioSleeper::shared(),
            reporter: NoopReporter::shared(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: SharedSleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download an episode to its final path and record the result.
    ///
    /// Returns the final path. Fails with [`DownloadError::Cancelled`] when
    /// `cancel` fires before an attempt or during a backoff delay, and with
    /// [`DownloadError::RetriesExhausted`] once every attempt has failed.
    pub async fn download_episode(
        &self,
        info: &DownloadInfo,
        context: &DownloadContext,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let destination = final_path(&self.config.download_dir, info);

        if let Some(completed) = self.already_present(info, &destination).await? {
            self.store
                .mark_downloaded(&info.episode_id, &completed)
                .await?;
            self.reporter.report(ProgressEvent::AlreadyPresent {
                worker_id: context.worker_id,
                episode_title: info.title.clone(),
                path: destination.clone(),
            });
            return Ok(destination);
        }

        let partial = partial_path(&self.config.download_dir, &info.episode_id);

        let max_attempts = self.config.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            attempt += 1;

            let error = match self
                .attempt(info, context, attempt, &partial, &destination)
                .await
            {
                Ok(completed) => {
                    self.store
                        .mark_downloaded(&info.episode_id, &completed)
                        .await?;
                    self.reporter.report(ProgressEvent::DownloadCompleted {
                        worker_id: context.worker_id,
                        episode_title: info.title.clone(),
                        bytes_downloaded: completed.size_bytes,
                        path: destination.clone(),
                    });
                    return Ok(destination);
                }
                Err(e) => e,
            };

            tracing::debug!(
                episode = %info.episode_id,
                attempt,
                max_attempts,
                "Download attempt failed: {}",
                error
            );
            if let Err(e) = self.store.increment_retry(&info.episode_id).await {
                tracing::warn!(episode = %info.episode_id, "Failed to record retry: {}", e);
            }

            if attempt >= max_attempts {
                return Err(DownloadError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.config.backoff_for(attempt - 1);
            self.reporter.report(ProgressEvent::RetryScheduled {
                worker_id: context.worker_id,
                episode_title: info.title.clone(),
                attempt,
                delay,
                error: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }

    /// The final file already holds the content recorded for this episode.
    async fn already_present(
        &self,
        info: &DownloadInfo,
        destination: &Path,
    ) -> Result<Option<CompletedDownload>, DownloadError> {
        let Some(expected) = info.hash.as_deref() else {
            return Ok(None);
        };

        let present = async {
            match existing_hash(destination).await? {
                Some(actual) if actual == expected => {
                    let size_bytes = file_len(destination).await?;
                    Ok(Some(CompletedDownload {
                        path: destination.to_path_buf(),
                        hash: actual,
                        size_bytes,
                    }))
                }
                _ => Ok::<_, DownloadError>(None),
            }
        };

        // Unreadable final file: fall through to a fresh download
        match present.await {
            Ok(completed) => Ok(completed),
            Err(e) => {
                tracing::warn!(
                    episode = %info.episode_id,
                    path = %destination.display(),
                    "Cannot check existing file, downloading again: {}",
                    e
                );
                Ok(None)
            }
        }
    }

    /// One request: fetch the missing bytes into the partial file, verify,
    /// and install.
    async fn attempt(
        &self,
        info: &DownloadInfo,
        context: &DownloadContext,
        attempt: u32,
        partial: &Path,
        destination: &Path,
    ) -> Result<CompletedDownload, DownloadError> {
        let url = info.enclosure_url.as_str();
        let open_error = |e: std::io::Error| DownloadError::FileOpenFailed {
            path: partial.to_path_buf(),
            source: e,
        };
        let write_error = |e: std::io::Error| DownloadError::FileWriteFailed {
            path: partial.to_path_buf(),
            source: e,
        };

        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                DownloadError::FileOpenFailed {
                    path: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(partial)
            .await
            .map_err(open_error)?;
        let offset = file.metadata().await.map_err(open_error)?.len();

        let response = self
            .client
            .get_stream(url, (offset > 0).then_some(offset))
            .await
            .map_err(|e| DownloadError::HttpFailed {
                url: url.to_string(),
                source: e,
            })?;

        let resume_from = match response.status {
            200 => {
                file.set_len(0).await.map_err(write_error)?;
                file.seek(SeekFrom::Start(0)).await.map_err(write_error)?;
                0
            }
            416 if offset > 0 && response.complete_length == Some(offset) => {
                // Left complete by a run that stopped before installing
                tracing::debug!(
                    episode = %info.episode_id,
                    bytes = offset,
                    "Partial file already holds the whole episode"
                );
                drop(file);
                return self.finish(info, context, partial, destination, offset).await;
            }
            206 => {
                let start = response.content_range_start.unwrap_or(offset);
                if start != offset {
                    return Err(DownloadError::RangeMismatch {
                        url: url.to_string(),
                        expected: offset,
                        actual: start,
                    });
                }
                file.seek(SeekFrom::End(0)).await.map_err(write_error)?;
                offset
            }
            status => {
                // The partial is longer than the resource; start over next time
                if status == 416 {
                    file.set_len(0).await.map_err(write_error)?;
                }
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status,
                });
            }
        };

        let total_bytes = response.content_length.map(|len| len + resume_from);
        self.reporter.report(ProgressEvent::DownloadStarting {
            worker_id: context.worker_id,
            episode_title: info.title.clone(),
            attempt,
            resume_from,
            content_length: total_bytes,
        });

        let mut bytes_downloaded = resume_from;
        let mut stream = response.body;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?;

            file.write_all(&chunk).await.map_err(write_error)?;

            bytes_downloaded += chunk.len() as u64;

            self.reporter.report(ProgressEvent::DownloadProgress {
                worker_id: context.worker_id,
                episode_title: info.title.clone(),
                bytes_downloaded,
                total_bytes,
            });
        }

        // Ensure all data is on disk before it is hashed and installed
        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        self.finish(info, context, partial, destination, bytes_downloaded)
            .await
    }

    /// Hash the finished partial file and move it into place.
    async fn finish(
        &self,
        info: &DownloadInfo,
        context: &DownloadContext,
        partial: &Path,
        destination: &Path,
        size_bytes: u64,
    ) -> Result<CompletedDownload, DownloadError> {
        let hash = hash_file(partial)
            .await
            .map_err(|e| DownloadError::HashFailed {
                path: partial.to_path_buf(),
                source: e,
            })?;
        self.reporter.report(ProgressEvent::HashingCompleted {
            worker_id: context.worker_id,
            episode_title: info.title.clone(),
            hash: hash.clone(),
        });

        if existing_hash(destination).await?.as_deref() == Some(hash.as_str()) {
            tracing::debug!(
                path = %destination.display(),
                "Identical file already installed, discarding download"
            );
            fs::remove_file(partial)
                .await
                .map_err(|e| DownloadError::FileWriteFailed {
                    path: partial.to_path_buf(),
                    source: e,
                })?;
        } else {
            install_file(partial, destination).await?;
        }

        Ok(CompletedDownload {
            path: destination.to_path_buf(),
            hash,
            size_bytes,
        })
    }
}

async fn file_len(path: &Path) -> Result<u64, DownloadError> {
    fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .map_err(|e| DownloadError::HashFailed {
            path: path.to_path_buf(),
            source: e,
        })
}
