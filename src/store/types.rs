use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpisodeState {
    New,
    Seen,
    Ignored,
    Queued,
    Downloaded,
    Deleted,
}

impl EpisodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Seen => "SEEN",
            Self::Ignored => "IGNORED",
            Self::Queued => "QUEUED",
            Self::Downloaded => "DOWNLOADED",
            Self::Deleted => "DELETED",
        }
    }

    /// Whether an episode in this state may be (re-)enqueued.
    ///
    /// Ignored episodes must be un-ignored first.
    pub fn can_enqueue(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown episode state '{0}'")]
pub struct ParseStateError(String);

impl FromStr for EpisodeState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "SEEN" => Ok(Self::Seen),
            "IGNORED" => Ok(Self::Ignored),
            "QUEUED" => Ok(Self::Queued),
            "DOWNLOADED" => Ok(Self::Downloaded),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

/// A podcast that episodes belong to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Podcast {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
}

/// Feed-side episode metadata, as handed over by a feed sync
#[derive(Debug, Clone, Default)]
pub struct NewEpisode {
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    pub description: Option<String>,
    pub enclosure_url: Option<String>,
    pub size_bytes: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A stored episode including its lifecycle columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosure_url: Option<String>,
    pub state: EpisodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// A pending download task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub episode_id: String,
    pub enqueued_at: DateTime<Utc>,
    /// Higher values are claimed first
    pub priority: i64,
}

/// Everything the transfer engine needs to fetch one episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    pub episode_id: String,
    pub title: String,
    pub podcast_title: String,
    pub enclosure_url: String,
    /// Content hash of the last successful download, if any
    pub hash: Option<String>,
}

/// Result of a finished transfer, persisted by `mark_downloaded`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
}
