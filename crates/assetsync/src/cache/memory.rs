//! # Memory Blob Cache
//!
//! In-process blob cache, used by tests and by hosts without a writable
//! data directory. Contents do not survive a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io;

use super::provider::{BlobCache, validate_namespace};

#[derive(Clone)]
struct Entry {
    data: Bytes,
    stored_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBlobCache {
    namespaces: RwLock<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an entry without going through `put`, keeping its timestamp.
    /// Lets tests simulate on-disk corruption.
    pub fn tamper(&self, namespace: &str, key: &str, data: Bytes) -> bool {
        let mut namespaces = self.namespaces.write();
        match namespaces.get_mut(namespace).and_then(|ns| ns.get_mut(key)) {
            Some(entry) => {
                entry.data = data;
                true
            }
            None => false,
        }
    }

    /// Backdate an entry, for staleness tests
    pub fn set_stored_at(&self, namespace: &str, key: &str, stored_at: DateTime<Utc>) -> bool {
        let mut namespaces = self.namespaces.write();
        match namespaces.get_mut(namespace).and_then(|ns| ns.get_mut(key)) {
            Some(entry) => {
                entry.stored_at = stored_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> io::Result<()> {
        validate_namespace(namespace)?;
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(
                key.to_string(),
                Entry {
                    data,
                    stored_at: Utc::now(),
                },
            );
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> io::Result<Option<Bytes>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|entry| entry.data.clone()))
    }

    async fn contains(&self, namespace: &str, key: &str) -> io::Result<bool> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key)))
    }

    async fn stored_at(&self, namespace: &str, key: &str) -> io::Result<Option<DateTime<Utc>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|entry| entry.stored_at))
    }

    async fn delete(&self, namespace: &str, key: &str) -> io::Result<()> {
        if let Some(ns) = self.namespaces.write().get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> io::Result<()> {
        self.namespaces.write().remove(namespace);
        Ok(())
    }

    async fn list_namespaces(&self) -> io::Result<Vec<String>> {
        let mut namespaces: Vec<String> = self.namespaces.read().keys().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }

    async fn sweep(&self) -> io::Result<()> {
        self.namespaces.write().retain(|_, ns| !ns.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = MemoryBlobCache::new();
        cache.put("v1", "a", Bytes::from_static(b"a")).await.unwrap();
        assert!(cache.contains("v1", "a").await.unwrap());
        assert_eq!(
            cache.get("v1", "a").await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );

        cache.delete("v1", "a").await.unwrap();
        assert!(!cache.contains("v1", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespace_listing() {
        let cache = MemoryBlobCache::new();
        cache.put("v2", "a", Bytes::new()).await.unwrap();
        cache.put("v1", "a", Bytes::new()).await.unwrap();
        assert_eq!(cache.list_namespaces().await.unwrap(), vec!["v1", "v2"]);

        cache.delete_namespace("v1").await.unwrap();
        assert_eq!(cache.list_namespaces().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_tamper() {
        let cache = MemoryBlobCache::new();
        assert!(!cache.tamper("v1", "a", Bytes::from_static(b"x")));
        cache.put("v1", "a", Bytes::from_static(b"a")).await.unwrap();
        assert!(cache.tamper("v1", "a", Bytes::from_static(b"x")));
        assert_eq!(
            cache.get("v1", "a").await.unwrap(),
            Some(Bytes::from_static(b"x"))
        );
    }
}
