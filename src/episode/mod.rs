mod download;
mod filename;
mod install;

pub use download::{DownloadContext, Downloader};
pub use filename::{PARTIAL_DIR, audio_extension, final_path, partial_path, sanitize_component};
pub use install::{hash_file, install_file};
