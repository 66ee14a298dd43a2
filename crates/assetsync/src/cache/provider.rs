//! # Blob Cache Provider
//!
//! This module defines the trait all blob cache backends implement.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io;

/// A namespace-scoped key to bytes store
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// Store `data` under `key`. A reader never observes a partially written value.
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> io::Result<()>;

    /// Get an entry, `None` if absent or incomplete
    async fn get(&self, namespace: &str, key: &str) -> io::Result<Option<Bytes>>;

    /// Check if the namespace holds a complete entry for `key`
    async fn contains(&self, namespace: &str, key: &str) -> io::Result<bool>;

    /// When the entry for `key` was committed
    async fn stored_at(&self, namespace: &str, key: &str) -> io::Result<Option<DateTime<Utc>>>;

    /// Remove a single entry. Missing entries are not an error.
    async fn delete(&self, namespace: &str, key: &str) -> io::Result<()>;

    /// Remove a namespace with all of its entries
    async fn delete_namespace(&self, namespace: &str) -> io::Result<()>;

    /// List live namespaces
    async fn list_namespaces(&self) -> io::Result<Vec<String>>;

    /// Remove leftovers from interrupted writes and deletions
    async fn sweep(&self) -> io::Result<()>;
}

/// Reject namespace names that cannot be used as a single path component.
pub fn validate_namespace(namespace: &str) -> io::Result<()> {
    let valid = !namespace.is_empty()
        && !namespace.starts_with('.')
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));

    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid cache namespace: {namespace:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("v1").is_ok());
        assert!(validate_namespace("2024.06.01-rc_1+build").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace(".trash").is_err());
        assert!(validate_namespace("../v1").is_err());
        assert!(validate_namespace("v1/evil").is_err());
    }
}
