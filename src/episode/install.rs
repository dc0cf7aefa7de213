use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's contents, read incrementally.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash of the file at `path`, or `None` when it does not exist.
pub async fn existing_hash(path: &Path) -> Result<Option<String>, DownloadError> {
    match hash_file(path).await {
        Ok(hash) => Ok(Some(hash)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DownloadError::HashFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Move a finished partial file to its final location.
///
/// A plain rename is tried first. When the two paths are on different
/// filesystems the data is copied next to the destination, synced, and
/// renamed into place, so the final path never holds a truncated file.
pub async fn install_file(partial: &Path, destination: &Path) -> Result<(), DownloadError> {
    let install_error = |source: io::Error| DownloadError::InstallFailed {
        from: partial.to_path_buf(),
        to: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.map_err(install_error)?;
    }

    match fs::rename(partial, destination).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(
                from = %partial.display(),
                to = %destination.display(),
                "Rename crosses filesystems, copying instead"
            );
            copy_then_replace(partial, destination)
                .await
                .map_err(install_error)
        }
        Err(e) => Err(install_error(e)),
    }
}

/// Copy `source` into a sibling of `destination`, fsync it, rename it over
/// `destination` and remove `source`.
pub(crate) async fn copy_then_replace(source: &Path, destination: &Path) -> io::Result<()> {
    let staging = staging_path(destination);

    let result = async {
        fs::copy(source, &staging).await?;
        File::open(&staging).await?.sync_all().await?;
        fs::rename(&staging, destination).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&staging).await;
        return Err(e);
    }

    fs::remove_file(source).await
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("episode"));
    name.push(".installing");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // sha256("hello world")
    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn hashes_file_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), HELLO_WORLD_SHA256);
    }

    #[tokio::test]
    async fn hashes_files_larger_than_the_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.mp3");
        let data = vec![7u8; HASH_BUFFER_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();

        let expected = format!("{:x}", Sha256::digest(&data));
        assert_eq!(hash_file(&path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn existing_hash_is_none_for_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(existing_hash(&dir.path().join("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn install_creates_parent_and_moves_file() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("x.partial");
        let destination = dir.path().join("Show").join("Episode.mp3");
        std::fs::write(&partial, b"audio").unwrap();

        install_file(&partial, &destination).await.unwrap();

        assert!(!partial.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"audio");
    }

    #[tokio::test]
    async fn install_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("x.partial");
        let destination = dir.path().join("Episode.mp3");
        std::fs::write(&partial, b"new").unwrap();
        std::fs::write(&destination, b"old").unwrap();

        install_file(&partial, &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"new");
    }

    #[tokio::test]
    async fn copy_fallback_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("x.partial");
        let destination = dir.path().join("Episode.mp3");
        std::fs::write(&partial, b"hello world").unwrap();

        copy_then_replace(&partial, &destination).await.unwrap();

        assert!(!partial.exists());
        assert!(!staging_path(&destination).exists());
        assert_eq!(hash_file(&destination).await.unwrap(), HELLO_WORLD_SHA256);
    }

    #[test]
    fn staging_file_sits_next_to_destination() {
        assert_eq!(
            staging_path(Path::new("/d/Show/Ep.mp3")),
            PathBuf::from("/d/Show/Ep.mp3.installing")
        );
    }
}
