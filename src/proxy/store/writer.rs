use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

/// An in-flight capture: metadata already written to the staging directory,
/// body file open for incremental writes. Publishing renames both artifacts
/// into the served location, metadata first. Anything neither published nor
/// discarded is cleaned up on drop, so an aborted capture never leaves
/// staged files behind.
pub struct StagedEntry {
    staged_meta: PathBuf,
    staged_body: PathBuf,
    published_meta: PathBuf,
    published_body: PathBuf,
    body_file: Option<AsyncFile>,
    bytes_written: u64,
    finished: bool,
}

impl StagedEntry {
    pub(super) fn new(
        staged_meta: PathBuf,
        staged_body: PathBuf,
        published_meta: PathBuf,
        published_body: PathBuf,
        body_file: AsyncFile,
    ) -> Self {
        Self {
            staged_meta,
            staged_body,
            published_meta,
            published_body,
            body_file: Some(body_file),
            bytes_written: 0,
            finished: false,
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .body_file
            .as_mut()
            .context("staged body already closed")?;
        file.write_all(chunk)
            .await
            .context("failed to write staged body chunk")?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Moves both staged artifacts into the served location. Metadata goes
    /// first; a reader racing the window between the two renames sees a miss
    /// and re-fetches.
    pub async fn publish(mut self) -> Result<()> {
        if let Some(mut file) = self.body_file.take() {
            file.flush().await.context("failed to flush staged body")?;
            file.sync_all()
                .await
                .context("failed to sync staged body")?;
        }
        async_fs::rename(&self.staged_meta, &self.published_meta)
            .await
            .with_context(|| {
                format!("failed to publish metadata {}", self.published_meta.display())
            })?;
        async_fs::rename(&self.staged_body, &self.published_body)
            .await
            .with_context(|| {
                format!("failed to publish body {}", self.published_body.display())
            })?;
        trace!(path = %self.published_body.display(), bytes = self.bytes_written, "published cache entry");
        self.finished = true;
        Ok(())
    }

    /// Deletes the staged artifacts. Missing files are fine; the point is
    /// that nothing of an aborted capture survives.
    pub async fn discard(mut self) {
        self.body_file.take();
        remove_quietly(&self.staged_meta).await;
        remove_quietly(&self.staged_body).await;
        self.finished = true;
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(err) = async_fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove staged file");
        }
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.body_file.take();
        for path in [&self.staged_meta, &self.staged_body] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to clean up staged file");
                }
            }
        }
    }
}
