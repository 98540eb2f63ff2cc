// pgvault/src/backup/writer.rs
//! Atomic Destination Writer.
//!
//! Bytes land in a hidden `.partial` temp file next to the destination and are
//! renamed into place only after the stream ends cleanly and the data is
//! synced. The final path therefore either holds a complete file or nothing.

use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};
use crate::source::ByteStream;

/// A file that reached its final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Hands out exclusive claims on destination paths and performs the writes.
///
/// Clones share their claims, so one writer can serve a whole engine.
#[derive(Debug, Clone, Default)]
pub struct DestinationWriter {
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

struct Claim {
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        claimed.remove(&self.path);
    }
}

impl DestinationWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, destination: &Path) -> Result<Claim> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        if !claimed.insert(destination.to_path_buf()) {
            return Err(BackupError::DuplicateDestination {
                path: destination.to_path_buf(),
            });
        }
        Ok(Claim {
            claimed: Arc::clone(&self.claimed),
            path: destination.to_path_buf(),
        })
    }

    /// Drains `stream` into `destination`.
    ///
    /// `temp_tag` goes into the temp file name so concurrent runs never share
    /// one. An existing file at `destination` is never overwritten. On any
    /// failure, including the future being dropped, the temp file is removed
    /// and `destination` is left untouched. Upstream errors are returned as-is.
    pub async fn write_atomically(
        &self,
        destination: &Path,
        temp_tag: &str,
        mut stream: ByteStream,
    ) -> Result<WrittenFile> {
        let _claim = self.claim(destination)?;

        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = destination
            .file_name()
            .ok_or_else(|| BackupError::write(destination, "destination has no file name"))?
            .to_string_lossy()
            .into_owned();

        if tokio::fs::try_exists(destination)
            .await
            .map_err(|e| BackupError::write(destination, e))?
        {
            return Err(BackupError::write(destination, "file already exists"));
        }

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.{}.", file_name, temp_tag))
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| BackupError::write(destination, format!("cannot create temp file: {}", e)))?;
        debug!(temp = %temp.path().display(), "writing temp file");

        let handle = temp
            .as_file()
            .try_clone()
            .map_err(|e| BackupError::write(temp.path(), e))?;
        let mut file = tokio::fs::File::from_std(handle);
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;

        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| BackupError::write(temp.path(), e))?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| BackupError::write(temp.path(), e))?;
        file.sync_all().await.map_err(|e| BackupError::write(temp.path(), e))?;
        drop(file);

        temp.persist_noclobber(destination)
            .map_err(|e| BackupError::write(destination, e.error))?;
        sync_dir(dir).await;

        Ok(WrittenFile {
            path: destination.to_path_buf(),
            bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    pub async fn write_bytes(&self, destination: &Path, temp_tag: &str, data: Vec<u8>) -> Result<WrittenFile> {
        let stream = futures::stream::once(async move { Ok(data) });
        self.write_atomically(destination, temp_tag, Box::pin(stream)).await
    }
}

/// Makes the rename durable. Failure here does not undo a completed write.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        let result = match tokio::fs::File::open(dir).await {
            Ok(handle) => handle.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(dir = %dir.display(), error = %e, "could not sync destination directory");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Creates `root` if needed and checks that a file can be created in it.
pub async fn prepare_root(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| BackupError::write(root, format!("cannot create directory: {}", e)))?;
    tempfile::Builder::new()
        .prefix(".pgvault-probe.")
        .tempfile_in(root)
        .map_err(|e| BackupError::write(root, format!("directory is not writable: {}", e)))?;
    Ok(())
}
