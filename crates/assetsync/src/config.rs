use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use url::Url;

use crate::error::SyncError;
use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

const DEFAULT_USER_AGENT: &str = concat!("assetsync/", env!("CARGO_PKG_VERSION"));

/// Placeholder replaced by the requested version in the manifest URL
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Configurable options for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Asset set version the host requires
    pub target_version: String,

    /// Manifest URL, `{version}` is substituted with the requested version.
    /// Asset paths are resolved relative to the resulting URL.
    pub manifest_url: String,

    /// Maximum number of assets downloaded at the same time
    pub download_concurrency: usize,

    /// Overall timeout for a single HTTP request, zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    /// Backoff for failed bootstrap attempts
    pub retry: RetryPolicy,

    /// Maximum age of a cached manifest used when the fresh fetch fails.
    /// `None` accepts a cached manifest of any age.
    pub fallback_max_age: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_version: String::new(),
            manifest_url: String::new(),
            download_concurrency: 2,
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: SyncConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            retry: RetryPolicy::default(),
            fallback_max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

impl SyncConfig {
    pub fn builder(
        target_version: impl Into<String>,
        manifest_url: impl Into<String>,
    ) -> crate::builder::SyncConfigBuilder {
        crate::builder::SyncConfigBuilder::new(target_version, manifest_url)
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, application/octet-stream;q=0.9, */*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers
    }

    /// Resolve the manifest URL for `version`
    pub fn manifest_url_for(&self, version: &str) -> Result<Url, SyncError> {
        let raw = self.manifest_url.replace(VERSION_PLACEHOLDER, version);
        Url::parse(&raw).map_err(|e| SyncError::UrlError(format!("{raw}: {e}")))
    }

    /// URL of an asset, resolved against the manifest URL of its version
    pub fn asset_url(&self, version: &str, path: &str) -> Result<Url, SyncError> {
        self.manifest_url_for(version)?
            .join(path)
            .map_err(|e| SyncError::UrlError(format!("{path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url_template() {
        let config = SyncConfig {
            manifest_url: "https://cdn.example.com/models/{version}/manifest.json".to_string(),
            ..Default::default()
        };
        let url = config.manifest_url_for("2024.1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cdn.example.com/models/2024.1/manifest.json"
        );
        assert_eq!(
            config.asset_url("2024.1", "weights/a.bin").unwrap().as_str(),
            "https://cdn.example.com/models/2024.1/weights/a.bin"
        );
    }

    #[test]
    fn test_invalid_manifest_url() {
        let config = SyncConfig {
            manifest_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.manifest_url_for("v1"),
            Err(SyncError::UrlError(_))
        ));
    }
}
