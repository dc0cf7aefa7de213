use clap::{Parser, Subcommand, ValueEnum};

use crate::store::EpisodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Queue podcast episodes and download them in the background
#[derive(Parser, Debug)]
#[command(name = "podqueue")]
#[command(about = "Persistent, resumable podcast episode downloads")]
#[command(version)]
pub struct Cli {
    /// Path to the episode database
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Directory downloaded episodes are written to
    #[arg(short = 'o', long, global = true)]
    pub download_dir: Option<String>,

    /// Number of concurrent download workers
    #[arg(short = 'c', long, global = true, default_value = "2")]
    pub workers: usize,

    /// Extra attempts per download after the first failure
    #[arg(long, global = true, default_value = "3")]
    pub retries: u32,

    /// Upper bound in seconds for the delay between attempts
    #[arg(long, global = true, default_value = "60")]
    pub max_backoff: u64,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log verbosity (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a podcast
    AddPodcast {
        id: String,
        title: String,
        #[arg(long)]
        feed_url: Option<String>,
    },

    /// Register an episode of a known podcast
    AddEpisode {
        id: String,
        #[arg(long)]
        podcast: String,
        #[arg(long)]
        title: String,
        /// Audio file URL
        #[arg(long)]
        url: String,
        #[arg(long)]
        description: Option<String>,
    },

    /// Add an episode to the download queue
    Enqueue {
        id: String,
        /// Higher values are downloaded first
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        priority: i64,
    },

    /// Drop an episode from the download queue
    Remove { id: String },

    /// Put a queued episode back on the queue without resetting its retry counter
    Requeue { id: String },

    /// Never download an episode
    Ignore { id: String },

    /// Undo `ignore`
    Unignore { id: String },

    /// Show pending downloads
    Queue {
        #[arg(long)]
        json: bool,
    },

    /// List known episodes
    Episodes {
        /// Only episodes in this state
        #[arg(long)]
        state: Option<EpisodeState>,
        #[arg(long)]
        json: bool,
    },

    /// Download one episode in the foreground
    Download { id: String },

    /// Start the worker pool and drain the queue
    Run {
        /// Keep running and wait for new work after the queue empties
        #[arg(long)]
        watch: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue_with_priority() {
        let cli = Cli::parse_from(["podqueue", "enqueue", "ep-1", "--priority", "-2"]);
        match cli.command {
            Command::Enqueue { id, priority } => {
                assert_eq!(id, "ep-1");
                assert_eq!(priority, -2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from(["podqueue", "run", "--watch", "--workers", "5", "-q"]);
        assert_eq!(cli.workers, 5);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Command::Run { watch: true }));
    }

    #[test]
    fn state_filter_parses_case_insensitively() {
        let cli = Cli::parse_from(["podqueue", "episodes", "--state", "downloaded"]);
        match cli.command {
            Command::Episodes { state, json } => {
                assert_eq!(state, Some(EpisodeState::Downloaded));
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_level_defaults_to_warn() {
        let cli = Cli::parse_from(["podqueue", "queue"]);
        assert_eq!(cli.log_level.as_filter(), "warn");
    }
}
