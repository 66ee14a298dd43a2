//! # Builder for SyncConfig
//!
//! Fluent construction of [`SyncConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use assetsync_engine::SyncConfig;
//!
//! let config = SyncConfig::builder("v3", "https://cdn.example.com/{version}/manifest.json")
//!     .with_download_concurrency(2)
//!     .with_connect_timeout(Duration::from_secs(15))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .with_retry_base_delay(Duration::from_secs(30))
//!     .build();
//!
//! assert_eq!(config.target_version, "v3");
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::SyncConfig;
use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

/// Builder for creating SyncConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new(target_version: impl Into<String>, manifest_url: impl Into<String>) -> Self {
        Self {
            config: SyncConfig {
                target_version: target_version.into(),
                manifest_url: manifest_url.into(),
                ..SyncConfig::default()
            },
        }
    }

    /// Set the number of assets downloaded concurrently (at least one)
    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.config.download_concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Merge headers into the defaults, custom values win
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self.config.use_system_proxy = false;
        self
    }

    /// Only takes effect when no explicit proxy is configured
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        if self.config.proxy.is_none() {
            self.config.use_system_proxy = use_system_proxy;
        }
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn with_fallback_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.config.fallback_max_age = max_age;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyAuth, ProxyType};

    #[test]
    fn test_builder_defaults() {
        let config = SyncConfigBuilder::new("v1", "https://example.com/{version}.json").build();
        assert_eq!(config.target_version, "v1");
        assert_eq!(config.download_concurrency, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.timeout.is_zero());
        assert!(config.follow_redirects);
        assert!(config.use_system_proxy);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.fallback_max_age.is_some());
    }

    #[test]
    fn test_builder_customization() {
        let config = SyncConfigBuilder::new("v1", "https://example.com/{version}.json")
            .with_download_concurrency(0)
            .with_connect_timeout(Duration::from_secs(20))
            .with_follow_redirects(false)
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_max_attempts(3)
            .with_fallback_max_age(None)
            .with_system_proxy(false)
            .build();

        assert_eq!(config.download_concurrency, 1);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert!(!config.follow_redirects);
        assert_eq!(config.user_agent, "CustomUserAgent/1.0");
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.fallback_max_age.is_none());
        assert!(!config.use_system_proxy);

        let header_value = config.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
        // Defaults are kept next to custom headers
        assert!(config.headers.contains_key(reqwest::header::ACCEPT));
    }

    #[test]
    fn test_explicit_proxy_disables_system_proxy() {
        let config = SyncConfigBuilder::new("v1", "https://example.com/{version}.json")
            .with_proxy(ProxyConfig {
                url: "http://proxy.example.com:8080".to_string(),
                proxy_type: ProxyType::Http,
                auth: Some(ProxyAuth {
                    username: "user".to_string(),
                    password: "pass".to_string(),
                }),
            })
            .with_system_proxy(true)
            .build();

        assert!(!config.use_system_proxy);
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.url, "http://proxy.example.com:8080");
        assert_eq!(proxy.auth.unwrap().username, "user");
    }
}
