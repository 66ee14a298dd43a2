//! # Transport
//!
//! The network seam of the engine. Manifest and asset fetches both go
//! through [`Transport`], which keeps the rest of the engine independent of
//! the HTTP client and lets tests script responses.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, ETAG, HeaderValue, IF_NONE_MATCH, PRAGMA};
use reqwest::{Client, StatusCode};
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info, trace};
use url::Url;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::proxy::build_proxy;

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// ETag sent as `If-None-Match`
    pub if_none_match: Option<String>,
    /// Ask intermediaries not to serve a cached response
    pub bypass_cache: bool,
}

/// Result of a GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    /// `304`: the resource matches the ETag that was sent
    NotModified,
    Fetched { body: Bytes, etag: Option<String> },
}

/// Byte progress callback: `(received, total)`
pub type ByteProgress = dyn Fn(u64, Option<u64>) + Send + Sync;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        options: &RequestOptions,
        progress: Option<&ByteProgress>,
    ) -> Result<FetchResponse, SyncError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &SyncConfig) -> Result<Client, SyncError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::TlsError(e.to_string()))?
        .with_platform_verifier()
        .map_err(|e| SyncError::TlsError(e.to_string()))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.download_concurrency.max(1))
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        client_builder = client_builder.proxy(build_proxy(proxy_config)?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if config.use_system_proxy {
        debug!("Using system proxy settings");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder.build().map_err(SyncError::from)
}

/// [`Transport`] over reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Ok(Self::new(create_client(config)?))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &Url,
        options: &RequestOptions,
        progress: Option<&ByteProgress>,
    ) -> Result<FetchResponse, SyncError> {
        let mut request = self.client.get(url.clone());

        if let Some(etag) = options.if_none_match.as_deref() {
            if let Ok(value) = HeaderValue::from_str(etag) {
                request = request.header(IF_NONE_MATCH, value);
            }
        }
        if options.bypass_cache {
            request = request
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .header(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(%url, "Not modified");
            return Ok(FetchResponse::NotModified);
        }
        if !status.is_success() {
            return Err(SyncError::Status {
                status,
                url: url.to_string(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total = response.content_length();

        let mut body = BytesMut::with_capacity(
            total
                .and_then(|t| usize::try_from(t).ok())
                .unwrap_or(0)
                .min(64 * 1024 * 1024),
        );
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                progress(body.len() as u64, total);
            }
        }

        trace!(%url, size = body.len(), "Fetched body");
        Ok(FetchResponse::Fetched {
            body: body.freeze(),
            etag,
        })
    }
}
