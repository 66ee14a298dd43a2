use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use super::types::{PersistedState, StateUpdate};
use crate::error::SyncError;

/// Durable key-value store for the bootstrap state record
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current record. A store that was never written reads as the default state.
    async fn read(&self) -> Result<PersistedState, SyncError>;

    /// Merge `update` into the stored record and return the result.
    /// The write is durable before this returns.
    async fn write(&self, update: StateUpdate) -> Result<PersistedState, SyncError>;

    /// Drop the stored record entirely
    async fn clear(&self) -> Result<(), SyncError>;
}

/// State store backed by a JSON document on disk
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<PersistedState, SyncError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PersistedState::default()),
            Err(e) => return Err(SyncError::Storage(e)),
        };

        serde_json::from_slice(&raw).map_err(|e| {
            warn!(path = ?self.path, error = %e, "Failed to parse persisted state");
            SyncError::CorruptState(e.to_string())
        })
    }

    async fn persist(&self, state: &PersistedState) -> Result<(), SyncError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::CorruptState(format!("failed to serialize state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(SyncError::Storage(e));
        }

        // Make the rename itself durable
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self) -> Result<PersistedState, SyncError> {
        self.load().await
    }

    async fn write(&self, update: StateUpdate) -> Result<PersistedState, SyncError> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.load().await?;
        if update.is_empty() {
            return Ok(state);
        }
        update.apply(&mut state);
        self.persist(&state).await?;

        debug!(phase = %state.phase, ready = state.ready, retry_count = state.retry_count, "Persisted state");
        Ok(state)
    }

    async fn clear(&self) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Storage(e)),
        }
    }
}

/// In-process state store, for tests and ephemeral hosts
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self) -> Result<PersistedState, SyncError> {
        Ok(self.state.lock().clone())
    }

    async fn write(&self, update: StateUpdate) -> Result<PersistedState, SyncError> {
        let mut state = self.state.lock();
        update.apply(&mut state);
        Ok(state.clone())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        *self.state.lock() = PersistedState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorCode;
    use crate::state::Phase;

    #[tokio::test]
    async fn test_missing_file_reads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.read().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn test_write_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStateStore::new(&path);
        store
            .write(
                StateUpdate::new()
                    .version(Some("v1".into()))
                    .ready(true)
                    .phase(Phase::Ready),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = FileStateStore::new(&path);
        let state = reopened.read().await.unwrap();
        assert_eq!(state.version.as_deref(), Some("v1"));
        assert!(state.ready);
        assert_eq!(state.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_partial_writes_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        let mut etags = HashMap::new();
        etags.insert("a.bin".to_string(), "\"1\"".to_string());
        store.write(StateUpdate::new().asset_etags(etags)).await.unwrap();
        store.write(StateUpdate::new().retry_count(2)).await.unwrap();

        let state = store.read().await.unwrap();
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.asset_etags.get("a.bin").map(String::as_str), Some("\"1\""));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.write(StateUpdate::new().retry_count(4)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .write(StateUpdate::new().error(Some(crate::ModelError::new(
                        ErrorCode::Network,
                        "offline",
                    ))))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let state = store.read().await.unwrap();
        assert_eq!(state.retry_count, 4);
        assert_eq!(state.error.map(|e| e.code), Some(ErrorCode::Network));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileStateStore::new(&path);
        let err = store.read().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        store.write(StateUpdate::new().ready(true)).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.read().await.unwrap().ready);
    }
}
