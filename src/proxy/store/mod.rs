mod entry;
mod writer;

pub use entry::EntryMetadata;
pub use writer::StagedEntry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tracing::{debug, warn};

use super::fingerprint::Fingerprint;

const STAGING_DIR: &str = "tmp";

/// Disk-backed store mapping fingerprints to metadata and body artifacts,
/// partitioned by namespace:
///
/// ```text
/// <base>/<namespace>/<fingerprint>.json
/// <base>/<namespace>/<fingerprint>
/// <base>/<namespace>/tmp/<fingerprint>.json
/// <base>/<namespace>/tmp/<fingerprint>
/// ```
pub struct ObjectStore {
    base_dir: PathBuf,
    prepared: Mutex<HashSet<String>>,
}

impl ObjectStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// True iff both artifacts are present in the published location.
    /// Creates the namespace directories on first use.
    pub async fn exists(&self, namespace: &str, key: &Fingerprint) -> Result<bool> {
        self.prepare_namespace(namespace).await?;
        let meta = artifact_exists(&self.published_meta_path(namespace, key)).await?;
        let body = artifact_exists(&self.published_body_path(namespace, key)).await?;
        Ok(meta && body)
    }

    pub async fn read_metadata(&self, namespace: &str, key: &Fingerprint) -> Result<EntryMetadata> {
        let path = self.published_meta_path(namespace, key);
        let raw = async_fs::read(&path)
            .await
            .with_context(|| format!("failed to read cached metadata {}", path.display()))?;
        EntryMetadata::from_json(&raw)
            .with_context(|| format!("failed to parse cached metadata {}", path.display()))
    }

    pub async fn read_body(&self, namespace: &str, key: &Fingerprint) -> Result<Vec<u8>> {
        let path = self.published_body_path(namespace, key);
        async_fs::read(&path)
            .await
            .with_context(|| format!("failed to read cached body {}", path.display()))
    }

    pub async fn open_body(&self, namespace: &str, key: &Fingerprint) -> Result<AsyncFile> {
        let path = self.published_body_path(namespace, key);
        AsyncFile::open(&path)
            .await
            .with_context(|| format!("failed to open cached body {}", path.display()))
    }

    /// Writes the metadata artifact to staging and opens the staged body
    /// file for writing. The returned [`StagedEntry`] owns cleanup.
    pub async fn stage(
        &self,
        namespace: &str,
        key: &Fingerprint,
        metadata: &EntryMetadata,
    ) -> Result<StagedEntry> {
        self.prepare_namespace(namespace).await?;
        let staged_meta = self.staged_meta_path(namespace, key);
        let staged_body = self.staged_body_path(namespace, key);

        async_fs::write(&staged_meta, metadata.to_json()?)
            .await
            .with_context(|| format!("failed to stage metadata {}", staged_meta.display()))?;
        let body_file = AsyncFile::create(&staged_body)
            .await
            .with_context(|| format!("failed to stage body {}", staged_body.display()))?;
        debug!(key = %key, namespace, "staged cache entry");

        Ok(StagedEntry::new(
            staged_meta,
            staged_body,
            self.published_meta_path(namespace, key),
            self.published_body_path(namespace, key),
            body_file,
        ))
    }

    /// Removes published artifacts for a key. Passthrough mode uses this to
    /// treat the store as scratch space.
    pub async fn purge(&self, namespace: &str, key: &Fingerprint) {
        for path in [
            self.published_meta_path(namespace, key),
            self.published_body_path(namespace, key),
        ] {
            if let Err(err) = async_fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to purge cache entry");
                }
            }
        }
    }

    /// One-time-per-process directory creation per namespace. The create
    /// itself is idempotent, so a concurrent first use is harmless.
    async fn prepare_namespace(&self, namespace: &str) -> Result<()> {
        if self.prepared.lock().contains(namespace) {
            return Ok(());
        }
        let staging = self.base_dir.join(namespace).join(STAGING_DIR);
        async_fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create cache directory {}", staging.display()))?;
        self.prepared.lock().insert(namespace.to_string());
        Ok(())
    }

    pub fn published_body_path(&self, namespace: &str, key: &Fingerprint) -> PathBuf {
        self.base_dir.join(namespace).join(key.id())
    }

    pub fn published_meta_path(&self, namespace: &str, key: &Fingerprint) -> PathBuf {
        self.base_dir
            .join(namespace)
            .join(format!("{}.json", key.id()))
    }

    fn staged_body_path(&self, namespace: &str, key: &Fingerprint) -> PathBuf {
        self.base_dir.join(namespace).join(STAGING_DIR).join(key.id())
    }

    fn staged_meta_path(&self, namespace: &str, key: &Fingerprint) -> PathBuf {
        self.base_dir
            .join(namespace)
            .join(STAGING_DIR)
            .join(format!("{}.json", key.id()))
    }
}

async fn artifact_exists(path: &Path) -> Result<bool> {
    async_fs::try_exists(path)
        .await
        .with_context(|| format!("failed to check {}", path.display()))
}
