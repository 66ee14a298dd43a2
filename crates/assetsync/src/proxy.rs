use reqwest::Proxy;

use crate::error::SyncError;

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
    /// All protocols proxy (use this for general-purpose proxies)
    All,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy used for manifest and asset requests
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            url: url.into(),
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// URL handed to reqwest; bare SOCKS5 addresses get their scheme
    fn effective_url(&self) -> String {
        let has_scheme = self.url.starts_with("socks5://") || self.url.starts_with("socks5h://");
        if self.proxy_type == ProxyType::Socks5 && !has_scheme {
            format!("socks5://{}", self.url)
        } else {
            self.url.clone()
        }
    }
}

/// Build a reqwest Proxy from the proxy configuration
pub fn build_proxy(config: &ProxyConfig) -> Result<Proxy, SyncError> {
    let url = config.effective_url();
    let built = match config.proxy_type {
        ProxyType::Http => Proxy::http(&url),
        ProxyType::Https => Proxy::https(&url),
        ProxyType::Socks5 | ProxyType::All => Proxy::all(&url),
    };

    let proxy = built.map_err(|e| {
        SyncError::ProxyError(format!("invalid {:?} proxy URL {url}: {e}", config.proxy_type))
    })?;

    Ok(match &config.auth {
        Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
        None => proxy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_proxy() {
        let config = ProxyConfig::new("127.0.0.1:1080", ProxyType::Socks5).with_auth("user", "pass");
        assert_eq!(config.effective_url(), "socks5://127.0.0.1:1080");
        assert!(build_proxy(&config).is_ok());

        let config = ProxyConfig::new("socks5h://proxy:1080", ProxyType::Socks5);
        assert_eq!(config.effective_url(), "socks5h://proxy:1080");
    }

    #[test]
    fn test_invalid_proxy_url() {
        let config = ProxyConfig::new("not a url", ProxyType::Http);
        let err = build_proxy(&config).unwrap_err();
        assert!(matches!(err, SyncError::ProxyError(_)));
    }
}
