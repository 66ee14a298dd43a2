//! # File Blob Cache
//!
//! Filesystem-backed blob cache. Layout:
//!
//! ```text
//! <root>/<namespace>/<sha256(key)>        data
//! <root>/<namespace>/<sha256(key)>.meta   {"key", "size", "storedAt"}
//! ```
//!
//! Entries are committed by renaming fsynced temp files into place, data
//! first and metadata last. An entry is only visible when its metadata
//! exists and the data length matches the recorded size.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use super::provider::{BlobCache, validate_namespace};

const TEMP_EXTENSION: &str = "tmp";
const META_EXTENSION: &str = "meta";
const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMetadata {
    key: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileBlobCache {
    root: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileBlobCache {
    /// Create a new file cache rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        fs::create_dir_all(&self.root).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn namespace_dir(&self, namespace: &str) -> io::Result<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn entry_paths(&self, namespace: &str, key: &str) -> io::Result<(PathBuf, PathBuf)> {
        let dir = self.namespace_dir(namespace)?;
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        let data_path = dir.join(&name);
        let meta_path = dir.join(format!("{name}.{META_EXTENSION}"));
        Ok((data_path, meta_path))
    }

    async fn read_metadata(&self, meta_path: &Path, key: &str) -> io::Result<Option<EntryMetadata>> {
        let raw = match fs::read(meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<EntryMetadata>(&raw) {
            Ok(meta) if meta.key == key => Ok(Some(meta)),
            Ok(meta) => {
                warn!(path = ?meta_path, expected = key, found = %meta.key, "Cache metadata key mismatch");
                Ok(None)
            }
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata");
                Ok(None)
            }
        }
    }
}

/// Write `data` to a fresh temp file next to `target` and fsync it.
async fn write_temp(target: &Path, data: &[u8]) -> io::Result<PathBuf> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = target.with_file_name(format!(
        "{file_name}.{}.{TEMP_EXTENSION}",
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = fs::File::create(&temp_path).await?;
    let result = async {
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(temp_path)
}

#[async_trait]
impl BlobCache for FileBlobCache {
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> io::Result<()> {
        self.ensure_initialized().await?;

        let (data_path, meta_path) = self.entry_paths(namespace, key)?;
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let metadata = EntryMetadata {
            key: key.to_string(),
            size: data.len() as u64,
            stored_at: Utc::now(),
        };
        let metadata_json = serde_json::to_vec(&metadata).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize metadata: {e}"),
            )
        })?;

        let temp_data_path = write_temp(&data_path, &data).await?;
        let temp_meta_path = match write_temp(&meta_path, &metadata_json).await {
            Ok(path) => path,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to write cache metadata file");
                let _ = fs::remove_file(&temp_data_path).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_data_path, &data_path).await {
            warn!(from = ?temp_data_path, to = ?data_path, error = %e, "Failed to commit cache data file");
            let _ = fs::remove_file(&temp_data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e);
        }

        // The old metadata (if any) now describes new data; a size mismatch
        // hides the entry until the rename below lands.
        if let Err(e) = fs::rename(&temp_meta_path, &meta_path).await {
            warn!(from = ?temp_meta_path, to = ?meta_path, error = %e, "Failed to commit cache metadata file");
            let _ = fs::remove_file(&meta_path).await;
            let _ = fs::remove_file(&data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e);
        }

        debug!(namespace, key, size = data.len(), "Committed cache entry");
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> io::Result<Option<Bytes>> {
        self.ensure_initialized().await?;

        let (data_path, meta_path) = self.entry_paths(namespace, key)?;
        let Some(metadata) = self.read_metadata(&meta_path, key).await? else {
            return Ok(None);
        };

        let data = match fs::read(&data_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if data.len() as u64 != metadata.size {
            warn!(
                namespace,
                key,
                expected = metadata.size,
                actual = data.len(),
                "Cache entry size does not match metadata, treating as absent"
            );
            return Ok(None);
        }

        Ok(Some(Bytes::from(data)))
    }

    async fn contains(&self, namespace: &str, key: &str) -> io::Result<bool> {
        self.ensure_initialized().await?;

        let (data_path, meta_path) = self.entry_paths(namespace, key)?;
        let Some(metadata) = self.read_metadata(&meta_path, key).await? else {
            return Ok(false);
        };

        match fs::metadata(&data_path).await {
            Ok(file_meta) => Ok(file_meta.len() == metadata.size),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stored_at(&self, namespace: &str, key: &str) -> io::Result<Option<DateTime<Utc>>> {
        self.ensure_initialized().await?;

        let (_, meta_path) = self.entry_paths(namespace, key)?;
        Ok(self
            .read_metadata(&meta_path, key)
            .await?
            .map(|meta| meta.stored_at))
    }

    async fn delete(&self, namespace: &str, key: &str) -> io::Result<()> {
        self.ensure_initialized().await?;

        let (data_path, meta_path) = self.entry_paths(namespace, key)?;

        // Metadata first so the entry disappears atomically for readers
        let meta_result = fs::remove_file(&meta_path).await;
        let data_result = fs::remove_file(&data_path).await;

        match (meta_result, data_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
                Err(e)
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
                Err(e)
            }
            _ => {
                debug!(namespace, key, "Removed cache entry");
                Ok(())
            }
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> io::Result<()> {
        self.ensure_initialized().await?;

        let dir = self.namespace_dir(namespace)?;
        let tombstone = self.root.join(format!(
            "{TRASH_PREFIX}{namespace}-{}",
            uuid::Uuid::new_v4().simple()
        ));

        // A single rename detaches the whole namespace from readers
        match fs::rename(&dir, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Err(e) = fs::remove_dir_all(&tombstone).await {
            warn!(path = ?tombstone, error = %e, "Failed to remove namespace tombstone, leaving it for sweep");
        }

        debug!(namespace, "Deleted cache namespace");
        Ok(())
    }

    async fn list_namespaces(&self) -> io::Result<Vec<String>> {
        self.ensure_initialized().await?;

        let mut entries = fs::read_dir(&self.root).await?;
        let mut namespaces = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_namespace(&name).is_ok() {
                namespaces.push(name);
            }
        }

        namespaces.sort();
        Ok(namespaces)
    }

    async fn sweep(&self) -> io::Result<()> {
        self.ensure_initialized().await?;

        let mut removed = 0usize;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.starts_with(TRASH_PREFIX) {
                match fs::remove_dir_all(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = ?path, error = %e, "Failed to remove namespace tombstone"),
                }
                continue;
            }

            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(&path).await?;
            while let Some(file) = files.next_entry().await? {
                let file_path = file.path();
                if file_path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    match fs::remove_file(&file_path).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = ?file_path, error = %e, "Failed to remove temp file"),
                    }
                }
            }
        }

        debug!(count = removed, "Swept cache leftovers");
        Ok(())
    }
}
