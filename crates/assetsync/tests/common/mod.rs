#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assetsync_engine::cache::MANIFEST_KEY;
use assetsync_engine::transport::ByteProgress;
use assetsync_engine::{
    BlobCache, Bootstrapper, ExternalWakeTimer, FetchResponse, MemoryBlobCache, MemoryStateStore,
    RequestOptions, StateStore, SyncConfig, SyncError, Transport, WakeTimer, integrity,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

pub const MANIFEST_URL: &str = "https://cdn.test/models/{version}/manifest.json";

struct Resource {
    body: Bytes,
    etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub if_none_match: Option<String>,
}

/// In-memory origin server with request counters and scripted failures
#[derive(Default)]
pub struct FakeServer {
    resources: Mutex<HashMap<String, Resource>>,
    failures: Mutex<HashMap<String, u32>>,
    offline: AtomicBool,
    requests: Mutex<Vec<Request>>,
}

pub fn path_of(version: &str, name: &str) -> String {
    format!("/models/{version}/{name}")
}

fn etag_for(body: &[u8]) -> String {
    format!("\"{}\"", &integrity::digest(body)[..16])
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a version: `(path, bytes, optional)` per asset. Assets listed
    /// with `None` bytes appear in the manifest but are not served.
    pub fn publish(&self, version: &str, assets: &[(&str, Option<&[u8]>, bool)]) {
        let entries: Vec<serde_json::Value> = assets
            .iter()
            .map(|(path, body, optional)| {
                let digest = integrity::digest(body.unwrap_or(b"never served"));
                serde_json::json!({ "path": path, "sha256": digest, "optional": optional })
            })
            .collect();
        let manifest = serde_json::json!({ "version": version, "assets": entries });

        self.serve(
            &path_of(version, MANIFEST_KEY),
            serde_json::to_vec(&manifest).unwrap(),
            false,
        );
        for (path, body, _) in assets {
            if let Some(body) = body {
                self.serve(&path_of(version, path), body.to_vec(), true);
            }
        }
    }

    pub fn serve(&self, path: &str, body: Vec<u8>, with_etag: bool) {
        let etag = with_etag.then(|| etag_for(&body));
        self.resources.lock().insert(
            path.to_string(),
            Resource {
                body: Bytes::from(body),
                etag,
            },
        );
    }

    /// Replace what the server sends for `path` while keeping the manifest as is
    pub fn corrupt(&self, path: &str, body: &[u8]) {
        if let Some(resource) = self.resources.lock().get_mut(path) {
            resource.body = Bytes::copy_from_slice(body);
        }
    }

    pub fn fail_times(&self, path: &str, times: u32) {
        self.failures.lock().insert(path.to_string(), times);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn count_for(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn get(
        &self,
        url: &Url,
        options: &RequestOptions,
        progress: Option<&ByteProgress>,
    ) -> Result<FetchResponse, SyncError> {
        let path = url.path().to_string();
        self.requests.lock().push(Request {
            path: path.clone(),
            if_none_match: options.if_none_match.clone(),
        });
        tokio::task::yield_now().await;

        let unavailable = || SyncError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: url.to_string(),
        };
        if self.offline.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&path).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(unavailable());
            }
        }

        let resources = self.resources.lock();
        let Some(resource) = resources.get(&path) else {
            return Err(SyncError::Status {
                status: StatusCode::NOT_FOUND,
                url: url.to_string(),
            });
        };
        if resource.etag.is_some() && resource.etag == options.if_none_match {
            return Ok(FetchResponse::NotModified);
        }
        if let Some(progress) = progress {
            let total = resource.body.len() as u64;
            progress(total, Some(total));
        }
        Ok(FetchResponse::Fetched {
            body: resource.body.clone(),
            etag: resource.etag.clone(),
        })
    }
}

pub fn config(version: &str) -> SyncConfig {
    SyncConfig::builder(version, MANIFEST_URL)
        .with_download_concurrency(2)
        .with_retry_base_delay(Duration::from_secs(60))
        .build()
}

/// Engine over in-memory stores
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub cache: Arc<MemoryBlobCache>,
    pub store: Arc<MemoryStateStore>,
    pub engine: Bootstrapper,
}

impl Harness {
    pub fn new(server: Arc<FakeServer>, version: &str) -> Self {
        Self::with_config(server, config(version))
    }

    pub fn with_config(server: Arc<FakeServer>, config: SyncConfig) -> Self {
        Self::with_parts(
            server,
            config,
            Arc::new(MemoryBlobCache::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(ExternalWakeTimer),
        )
    }

    pub fn with_parts(
        server: Arc<FakeServer>,
        config: SyncConfig,
        cache: Arc<MemoryBlobCache>,
        store: Arc<MemoryStateStore>,
        timer: Arc<dyn WakeTimer>,
    ) -> Self {
        let engine = Bootstrapper::new(
            config,
            server.clone(),
            cache.clone(),
            store.clone(),
            timer,
        );
        Self {
            server,
            cache,
            store,
            engine,
        }
    }

    /// Same stores, different target version
    pub fn retarget(&self, version: &str) -> Self {
        Self::with_parts(
            self.server.clone(),
            config(version),
            self.cache.clone(),
            self.store.clone(),
            Arc::new(ExternalWakeTimer),
        )
    }

    /// Pretend the scheduled retry is due now
    pub async fn make_retry_due(&self) {
        let state = self.store.read().await.unwrap();
        assert!(state.next_retry_at.is_some(), "no retry scheduled: {state:?}");
        self.store
            .write(
                assetsync_engine::StateUpdate::new()
                    .next_retry_at(Some(chrono::Utc::now() - chrono::Duration::seconds(1))),
            )
            .await
            .unwrap();
    }

    pub async fn namespaces(&self) -> Vec<String> {
        let mut namespaces = self.cache.list_namespaces().await.unwrap();
        namespaces.sort();
        namespaces
    }
}
