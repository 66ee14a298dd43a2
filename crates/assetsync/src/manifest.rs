//! # Manifest
//!
//! The manifest names one immutable asset set version and the SHA-256 of
//! every file in it. Wire format:
//!
//! ```json
//! { "version": "v1", "assets": [ { "path": "a.bin", "sha256": "<64 hex>", "optional": false } ] }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{BlobCache, MANIFEST_KEY, validate_namespace};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::integrity::is_valid_digest;
use crate::transport::{FetchResponse, RequestOptions, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Path relative to the manifest URL, also the blob cache key
    pub path: String,
    /// Expected hex SHA-256 of the asset bytes
    #[serde(rename = "sha256")]
    pub digest: String,
    /// Optional assets may be missing without failing the bootstrap
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub assets: Vec<Asset>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn parse(raw: &[u8]) -> Result<Self, SyncError> {
        let document: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| SyncError::MalformedManifest(format!("invalid JSON: {e}")))?;

        match document.get("version") {
            Some(serde_json::Value::String(_)) => {}
            Some(_) => return Err(malformed("`version` must be a string")),
            None => return Err(malformed("missing `version`")),
        }
        if !document.get("assets").is_some_and(serde_json::Value::is_array) {
            return Err(malformed("`assets` must be an array"));
        }

        let manifest: Manifest = serde_json::from_value(document)
            .map_err(|e| SyncError::MalformedManifest(format!("invalid asset entry: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), SyncError> {
        validate_namespace(&self.version)
            .map_err(|_| malformed(format!("unusable version string {:?}", self.version)))?;

        let mut seen = HashSet::new();
        for asset in &self.assets {
            validate_asset_path(&asset.path)?;
            if !is_valid_digest(&asset.digest) {
                return Err(malformed(format!(
                    "asset {} has an invalid sha256 {:?}",
                    asset.path, asset.digest
                )));
            }
            if !seen.insert(asset.path.as_str()) {
                return Err(malformed(format!("duplicate asset path {}", asset.path)));
            }
        }
        Ok(())
    }

    pub fn asset(&self, path: &str) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.path == path)
    }

    pub fn required_assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.iter().filter(|asset| !asset.optional)
    }
}

fn malformed(message: impl Into<String>) -> SyncError {
    SyncError::MalformedManifest(message.into())
}

fn validate_asset_path(path: &str) -> Result<(), SyncError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path == MANIFEST_KEY
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        Err(malformed(format!("invalid asset path {path:?}")))
    } else {
        Ok(())
    }
}

/// Options for a manifest fetch
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Ask intermediaries for a fresh copy
    pub bypass_cache: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { bypass_cache: true }
    }
}

/// Fetches manifests over the transport and keeps the last good copy of
/// each version in the blob cache.
pub struct ManifestFetcher {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn BlobCache>,
    config: Arc<SyncConfig>,
}

impl ManifestFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn BlobCache>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    /// Fetch the manifest for `version` from the network. A valid document
    /// replaces the cached copy; an invalid one leaves it untouched.
    pub async fn fetch(&self, version: &str, options: FetchOptions) -> Result<Manifest, SyncError> {
        let url = self.config.manifest_url_for(version)?;
        debug!(%url, bypass_cache = options.bypass_cache, "Fetching manifest");

        let request = RequestOptions {
            if_none_match: None,
            bypass_cache: options.bypass_cache,
        };
        let body = match self.transport.get(&url, &request, None).await? {
            FetchResponse::Fetched { body, .. } => body,
            FetchResponse::NotModified => {
                return Err(SyncError::UnexpectedNotModified(url.to_string()));
            }
        };

        let manifest = self.parse_for(version, &body)?;
        self.cache
            .put(&manifest.version, MANIFEST_KEY, body)
            .await?;

        info!(version = %manifest.version, assets = manifest.assets.len(), "Fetched manifest");
        Ok(manifest)
    }

    /// Read the cached manifest for `version`, subject to the configured
    /// staleness bound.
    pub async fn fallback(&self, version: &str) -> Result<Manifest, SyncError> {
        let Some(body) = self.cache.get(version, MANIFEST_KEY).await? else {
            return Err(SyncError::NoCachedManifest(version.to_string()));
        };

        if let Some(max_age) = self.config.fallback_max_age {
            let stored_at = self.cache.stored_at(version, MANIFEST_KEY).await?;
            let age = stored_at.map(|at| Utc::now() - at);
            let too_old = match (age, chrono::Duration::from_std(max_age)) {
                (Some(age), Ok(max_age)) => age > max_age,
                (Some(_), Err(_)) => false,
                (None, _) => true,
            };
            if too_old {
                let age_secs = age.map(|a| a.num_seconds()).unwrap_or(-1);
                warn!(version, age_secs, "Cached manifest too old to use as fallback");
                return Err(SyncError::StaleManifest {
                    version: version.to_string(),
                    age_secs,
                });
            }
        }

        let manifest = self.parse_for(version, &body)?;
        warn!(version, "Using cached manifest as fallback");
        Ok(manifest)
    }

    /// Cached manifest of a version without any staleness bound
    pub async fn cached(&self, version: &str) -> Result<Option<Manifest>, SyncError> {
        match self.cache.get(version, MANIFEST_KEY).await? {
            Some(body) => self.parse_for(version, &body).map(Some),
            None => Ok(None),
        }
    }

    fn parse_for(&self, version: &str, body: &Bytes) -> Result<Manifest, SyncError> {
        let manifest = Manifest::parse(body)?;
        if manifest.version != version {
            return Err(malformed(format!(
                "requested version {version} but manifest declares {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const DIGEST: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn doc(body: &str) -> Vec<u8> {
        body.replace("{digest}", DIGEST).into_bytes()
    }

    #[test]
    fn test_parse_valid_manifest() {
        let manifest = Manifest::parse(&doc(
            r#"{"version":"v1","assets":[
                {"path":"weights/a.bin","sha256":"{digest}"},
                {"path":"b.bin","sha256":"{digest}","optional":true}
            ]}"#,
        ))
        .unwrap();

        assert_eq!(manifest.version, "v1");
        assert_eq!(manifest.assets.len(), 2);
        assert!(!manifest.assets[0].optional);
        assert!(manifest.asset("b.bin").unwrap().optional);
        assert_eq!(manifest.required_assets().count(), 1);
    }

    #[test]
    fn test_reject_structural_problems() {
        let cases = [
            r#"{"assets":[]}"#,
            r#"{"version":3,"assets":[]}"#,
            r#"{"version":"v1"}"#,
            r#"{"version":"v1","assets":{}}"#,
            r#"{"version":"v1","assets":[{"path":"a.bin"}]}"#,
            r#"{"version":"v1","assets":[{"path":"a.bin","sha256":"abc"}]}"#,
            r#"{"version":"v1","assets":[{"path":"../a.bin","sha256":"{digest}"}]}"#,
            r#"{"version":"v1","assets":[{"path":"/etc/a","sha256":"{digest}"}]}"#,
            r#"{"version":"v1","assets":[{"path":"manifest.json","sha256":"{digest}"}]}"#,
            r#"{"version":"v1","assets":[{"path":"a","sha256":"{digest}"},{"path":"a","sha256":"{digest}"}]}"#,
            r#"{"version":"../v1","assets":[]}"#,
            "not json",
        ];

        for case in cases {
            let err = Manifest::parse(&doc(case)).unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedManifest, "case: {case}");
        }
    }
}
