use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use crate::store::DownloadInfo;

/// Maximum length for a sanitized path component
const MAX_COMPONENT_LENGTH: usize = 100;

/// Directory under the download root holding in-progress transfers
pub const PARTIAL_DIR: &str = ".partial";

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Final location of an episode:
/// `<download_dir>/<podcast title>/<episode title>.<ext>`.
///
/// Components that sanitize to nothing fall back to the episode id.
pub fn final_path(download_dir: &Path, info: &DownloadInfo) -> PathBuf {
    let fallback = sanitize_component(&info.episode_id);
    let fallback = if fallback.is_empty() {
        "episode".to_string()
    } else {
        fallback
    };

    let podcast_dir = non_empty_or(sanitize_component(&info.podcast_title), &fallback);
    let stem = non_empty_or(sanitize_component(&info.title), &fallback);
    let ext = audio_extension(&info.enclosure_url);

    download_dir
        .join(podcast_dir)
        .join(format!("{}.{}", stem, ext))
}

/// Location of the partial file for an episode.
///
/// Named after the SHA-256 of the episode id so that concurrent transfers
/// never share a partial and the name is always filesystem safe.
pub fn partial_path(download_dir: &Path, episode_id: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(episode_id.as_bytes()));
    download_dir
        .join(PARTIAL_DIR)
        .join(format!("{}.partial", digest))
}

/// Get the audio file extension from an enclosure URL, defaulting to "mp3"
pub fn audio_extension(enclosure_url: &str) -> String {
    Url::parse(enclosure_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|filename| filename.rsplit_once('.'))
                .map(|(_, ext)| ext.to_lowercase())
        })
        .filter(|ext| is_valid_audio_extension(ext))
        .unwrap_or_else(|| "mp3".to_string())
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Sanitize a title for use as a single path component
pub fn sanitize_component(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    // Collapse multiple spaces/dashes into single dash
    let collapsed = collapse_separators(&sanitized);

    // Dots are trimmed too so "." and ".." can never come out
    let trimmed =
        collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    if trimmed.len() > MAX_COMPONENT_LENGTH {
        // Truncate at word boundary if possible
        truncate_at_boundary(trimmed, MAX_COMPONENT_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    // Find the last separator before max_len
    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

/// Check if a string is a valid audio file extension
fn is_valid_audio_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}
