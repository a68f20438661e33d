//! Download of one remote file into the staging area.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::operation::join_relative;
use crate::progress::TaskProgress;
use crate::transport::Transport;

/// Suffix of files still being written.
pub const PART_SUFFIX: &str = ".part";

/// What to download and where it belongs.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Root-relative path of the file.
    pub path: CompactString,
    /// Absolute URL to fetch.
    pub url: String,
    /// Advertised size, checked once the body is written.
    pub expected_size: Option<u64>,
    /// Remote modification time, copied onto the staged file.
    pub modified: Option<DateTime<Utc>>,
}

/// A finished download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Root-relative path of the file.
    pub path: CompactString,
    /// Where the verified file now lives.
    pub staged_path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
}

/// Downloads one file to `<staging>/<path>` via a `.part` file.
#[derive(Debug)]
pub struct DownloadTask {
    request: DownloadRequest,
    staged_path: PathBuf,
    progress: Arc<TaskProgress>,
    cancel: CancellationToken,
}

impl DownloadTask {
    pub fn new(request: DownloadRequest, staging_root: &Path, cancel: CancellationToken) -> Self {
        let staged_path = join_relative(staging_root, &request.path);
        let progress = Arc::new(TaskProgress::new(request.expected_size.unwrap_or(0)));
        Self {
            request,
            staged_path,
            progress,
            cancel,
        }
    }

    /// Shared byte counters of this task.
    pub fn progress(&self) -> Arc<TaskProgress> {
        Arc::clone(&self.progress)
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    /// Run the download to completion, failure or cancellation.
    ///
    /// The part file is removed on every unsuccessful exit.
    pub async fn run(self, transport: &dyn Transport) -> Result<DownloadOutcome, DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let part_path = part_path(&self.staged_path);
        let result = self.fetch_into(transport, &part_path).await;
        match result {
            Ok(bytes) => {
                tracing::debug!(path = %self.request.path, bytes, "download staged");
                Ok(DownloadOutcome {
                    path: self.request.path,
                    staged_path: self.staged_path,
                    bytes,
                })
            }
            Err(err) => {
                if let Err(rm) = tokio::fs::remove_file(&part_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %part_path.display(), err = %rm, "cannot remove part file");
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_into(
        &self,
        transport: &dyn Transport,
        part_path: &Path,
    ) -> Result<u64, DownloadError> {
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut download = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            opened = transport.download(&self.request.url) => opened?,
        };
        if let Some(length) = download.content_length {
            self.progress.raise_total(length);
        }

        let mut file = tokio::fs::File::create(part_path)
            .await
            .map_err(|e| DownloadError::io(part_path, e))?;
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = download.chunks.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(part_path, e))?;
            written += chunk.len() as u64;
            self.progress.add(chunk.len() as u64);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(part_path, e))?;
        drop(file);

        if let Some(expected) = self.request.expected_size {
            if written != expected {
                return Err(DownloadError::SizeMismatch {
                    path: self.request.path.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        let part = part_path.to_path_buf();
        let staged = self.staged_path.clone();
        let modified = self.request.modified;
        tokio::task::spawn_blocking(move || finish_staged(&part, &staged, modified))
            .await
            .map_err(|e| DownloadError::io(part_path, std::io::Error::other(e)))?
            .map_err(|e| DownloadError::io(&self.staged_path, e))?;

        Ok(written)
    }
}

/// Path of the in-flight file for `staged`.
pub fn part_path(staged: &Path) -> PathBuf {
    let mut name = staged.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn finish_staged(
    part: &Path,
    staged: &Path,
    modified: Option<DateTime<Utc>>,
) -> std::io::Result<()> {
    if let Some(modified) = modified {
        let file = std::fs::OpenOptions::new().write(true).open(part)?;
        file.set_modified(modified.into())?;
    }
    if let Ok(meta) = std::fs::symlink_metadata(staged) {
        if meta.is_dir() {
            std::fs::remove_dir_all(staged)?;
        }
    }
    std::fs::rename(part, staged)
}
