//! # Downloader
//!
//! Fetches the assets of a manifest that are not yet in its namespace.
//! Every payload is verified against the manifest digest before it is
//! committed; a mismatching payload is dropped and reported, never cached.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{debug, error, info, warn};

use crate::cache::BlobCache;
use crate::config::SyncConfig;
use crate::error::{ErrorCode, SyncError};
use crate::integrity;
use crate::manifest::{Asset, Manifest};
use crate::progress::{AssetOutcome, OnProgress, ProgressEvent};
use crate::transport::{ByteProgress, FetchResponse, RequestOptions, Transport};

/// A single asset that could not be brought into the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub path: String,
    pub code: ErrorCode,
    pub message: String,
}

/// Result of one download batch
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// ETag map after the batch, merged with the map passed in
    pub etags: HashMap<String, String>,
    /// Failed required assets; any entry fails the bootstrap
    pub failures: Vec<AssetFailure>,
    /// Failed optional assets
    pub optional_failures: Vec<AssetFailure>,
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
}

impl DownloadReport {
    pub fn failed_paths(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.path.clone()).collect()
    }

    /// Most severe error code among the required failures
    pub fn failure_code(&self) -> Option<ErrorCode> {
        let codes: Vec<ErrorCode> = self.failures.iter().map(|f| f.code).collect();
        if codes.is_empty() {
            None
        } else if codes.contains(&ErrorCode::IntegrityMismatch) {
            Some(ErrorCode::IntegrityMismatch)
        } else if codes.contains(&ErrorCode::StorageUnavailable) {
            Some(ErrorCode::StorageUnavailable)
        } else {
            Some(ErrorCode::BootstrapFailed)
        }
    }
}

struct FetchedAsset {
    outcome: AssetOutcome,
    etag: Option<String>,
}

pub struct Downloader {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn BlobCache>,
    config: Arc<SyncConfig>,
}

impl Downloader {
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

    /// Bring every asset of `manifest` into its namespace.
    ///
    /// `previous` names the namespace of the last ready version. Assets
    /// found there are requested with their known ETag, and a `304` reuses
    /// the earlier bytes instead of downloading them again.
    pub async fn download_missing(
        &self,
        manifest: &Manifest,
        etags: &HashMap<String, String>,
        previous: Option<&str>,
        progress: Option<&OnProgress>,
    ) -> Result<DownloadReport, SyncError> {
        let namespace = manifest.version.as_str();
        let previous = previous.filter(|prev| *prev != namespace);
        let mut report = DownloadReport {
            etags: etags.clone(),
            ..Default::default()
        };

        let mut pending: Vec<&Asset> = Vec::new();
        for asset in &manifest.assets {
            if self.cache.contains(namespace, &asset.path).await? {
                debug!(path = %asset.path, "Asset already present, skipping");
                emit(progress, ProgressEvent::AssetFinished {
                    path: asset.path.clone(),
                    outcome: AssetOutcome::Skipped,
                });
                report.skipped.push(asset.path.clone());
            } else {
                pending.push(asset);
            }
        }

        if pending.is_empty() {
            return Ok(report);
        }

        let concurrency = self.config.download_concurrency.max(1);
        info!(
            version = namespace,
            missing = pending.len(),
            concurrency,
            "Downloading missing assets"
        );

        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < concurrency {
                let Some(asset) = queue.next() else {
                    break;
                };
                let known_etag = etags.get(&asset.path).cloned();
                in_flight.push(async move {
                    let result = self
                        .fetch_asset(namespace, asset, known_etag, previous, progress)
                        .await;
                    (asset, result)
                });
            }

            let Some((asset, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(fetched) => {
                    match fetched.etag {
                        Some(etag) => {
                            report.etags.insert(asset.path.clone(), etag);
                        }
                        None if fetched.outcome == AssetOutcome::Downloaded => {
                            report.etags.remove(&asset.path);
                        }
                        None => {}
                    }
                    emit(progress, ProgressEvent::AssetFinished {
                        path: asset.path.clone(),
                        outcome: fetched.outcome,
                    });
                    report.downloaded.push(asset.path.clone());
                }
                Err(e) => {
                    let failure = AssetFailure {
                        path: asset.path.clone(),
                        code: e.code(),
                        message: e.to_string(),
                    };
                    emit(progress, ProgressEvent::AssetFinished {
                        path: asset.path.clone(),
                        outcome: AssetOutcome::Failed(failure.code),
                    });

                    if asset.optional {
                        warn!(path = %asset.path, error = %e, "Optional asset failed");
                        report.optional_failures.push(failure);
                    } else {
                        error!(path = %asset.path, error = %e, "Required asset failed");
                        report.failures.push(failure);
                    }
                }
            }
        }

        info!(
            version = namespace,
            downloaded = report.downloaded.len(),
            failed = report.failures.len(),
            optional_failed = report.optional_failures.len(),
            "Download batch finished"
        );
        Ok(report)
    }

    async fn fetch_asset(
        &self,
        namespace: &str,
        asset: &Asset,
        known_etag: Option<String>,
        previous: Option<&str>,
        progress: Option<&OnProgress>,
    ) -> Result<FetchedAsset, SyncError> {
        let url = self.config.asset_url(namespace, &asset.path)?;

        // A conditional request only makes sense with a copy to fall back on
        let candidate = match (previous, known_etag.as_ref()) {
            (Some(prev), Some(_)) => self.cache.get(prev, &asset.path).await?,
            _ => None,
        };
        let options = RequestOptions {
            if_none_match: candidate.as_ref().and(known_etag.clone()),
            bypass_cache: false,
        };

        emit(progress, ProgressEvent::AssetStarted {
            path: asset.path.clone(),
        });

        let path = asset.path.clone();
        let on_bytes = progress.map(|progress| {
            let progress = progress.clone();
            move |bytes: u64, total: Option<u64>| {
                progress(ProgressEvent::AssetProgress {
                    path: path.clone(),
                    bytes,
                    total,
                })
            }
        });
        let on_bytes_ref = on_bytes.as_ref().map(|f| f as &ByteProgress);

        let (body, etag, outcome) = match self.transport.get(&url, &options, on_bytes_ref).await? {
            FetchResponse::Fetched { body, etag } => (body, etag, AssetOutcome::Downloaded),
            FetchResponse::NotModified => match candidate {
                Some(body) => {
                    debug!(path = %asset.path, "Not modified, reusing previous copy");
                    (body, known_etag, AssetOutcome::NotModified)
                }
                None => return Err(SyncError::UnexpectedNotModified(url.to_string())),
            },
        };

        self.verify_and_commit(namespace, asset, body).await?;
        Ok(FetchedAsset { outcome, etag })
    }

    async fn verify_and_commit(
        &self,
        namespace: &str,
        asset: &Asset,
        body: Bytes,
    ) -> Result<(), SyncError> {
        if !integrity::verify(&body, &asset.digest) {
            return Err(SyncError::IntegrityMismatch {
                path: asset.path.clone(),
                expected: asset.digest.clone(),
                actual: integrity::digest(&body),
            });
        }

        let size = body.len();
        self.cache.put(namespace, &asset.path, body).await?;
        debug!(path = %asset.path, size, "Committed verified asset");
        Ok(())
    }
}

fn emit(progress: Option<&OnProgress>, event: ProgressEvent) {
    if let Some(progress) = progress {
        progress(event);
    }
}
