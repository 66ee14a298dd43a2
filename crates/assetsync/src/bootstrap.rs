//! # Bootstrap Orchestrator
//!
//! Drives the persisted state machine
//!
//! ```text
//! IDLE -> CHECKING -> DOWNLOADING -> VERIFYING -> READY
//!            |  \________________________/
//!            |   (version unchanged and complete)
//!            +--> ERROR --(retry due)--> IDLE
//! ```
//!
//! Each phase is written to the [`StateStore`] before its work starts, so a
//! restarted process resumes from the last durable step. Only one attempt
//! runs at a time; concurrent callers join it.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::{BlobCache, FileBlobCache};
use crate::config::SyncConfig;
use crate::downloader::Downloader;
use crate::error::{ErrorCode, ModelError, SyncError};
use crate::integrity;
use crate::manifest::{FetchOptions, Manifest, ManifestFetcher};
use crate::progress::{OnProgress, ProgressEvent};
use crate::retry::{DueCallback, RetryDecision, RetryScheduler, WakeTimer, due_retry};
use crate::state::{FileStateStore, PersistedState, Phase, StateStore, StateUpdate};
use crate::transport::{HttpTransport, Transport};

const STATE_FILE: &str = "state.json";
const BLOB_DIR: &str = "blobs";

/// Why the host is initializing the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum InitReason {
    /// First install of the host application
    Install,
    /// The host application was updated
    Update,
    /// Regular process start
    Startup,
}

/// Snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub state: PersistedState,
    pub target_version: String,
    pub available_namespaces: Vec<String>,
}

type AttemptFuture = Shared<BoxFuture<'static, Result<(), ModelError>>>;

struct InFlight {
    future: AttemptFuture,
    listeners: Arc<Mutex<Vec<OnProgress>>>,
}

struct Inner {
    config: Arc<SyncConfig>,
    cache: Arc<dyn BlobCache>,
    store: Arc<dyn StateStore>,
    fetcher: ManifestFetcher,
    downloader: Downloader,
    scheduler: RetryScheduler,
    in_flight: Mutex<Option<InFlight>>,
    swept: AtomicBool,
}

/// Public entry point of the engine. Cheap to clone.
#[derive(Clone)]
pub struct Bootstrapper {
    inner: Arc<Inner>,
}

impl Bootstrapper {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn BlobCache>,
        store: Arc<dyn StateStore>,
        timer: Arc<dyn WakeTimer>,
    ) -> Self {
        let config = Arc::new(config);
        let inner = Arc::new(Inner {
            fetcher: ManifestFetcher::new(transport.clone(), cache.clone(), config.clone()),
            downloader: Downloader::new(transport, cache.clone(), config.clone()),
            scheduler: RetryScheduler::new(config.retry.clone(), store.clone(), timer),
            config,
            cache,
            store,
            in_flight: Mutex::new(None),
            swept: AtomicBool::new(false),
        });

        // The timer must not keep the engine alive
        let weak = Arc::downgrade(&inner);
        let callback: DueCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let bootstrapper = Bootstrapper { inner };
                if let Err(e) = bootstrapper.resume_pending_retry().await {
                    warn!(error = %e, "Scheduled retry failed");
                }
            }
            .boxed()
        });
        inner.scheduler.on_due(callback);

        Self { inner }
    }

    /// Engine over the filesystem stores under `data_dir` and an HTTP
    /// transport built from `config`
    pub fn open(
        config: SyncConfig,
        data_dir: impl AsRef<Path>,
        timer: Arc<dyn WakeTimer>,
    ) -> Result<Self, SyncError> {
        let data_dir = data_dir.as_ref();
        let transport = Arc::new(HttpTransport::from_config(&config)?);
        let cache = Arc::new(FileBlobCache::new(data_dir.join(BLOB_DIR)));
        let store = Arc::new(FileStateStore::new(data_dir.join(STATE_FILE)));

        info!(data_dir = %data_dir.display(), "Opening asset store");
        Ok(Self::new(config, transport, cache, store, timer))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Make sure the target version is present and verified.
    ///
    /// Returns immediately when the persisted state already says so.
    pub async fn ensure_ready(&self) -> Result<(), ModelError> {
        self.ensure_ready_with_progress(None).await
    }

    pub async fn ensure_ready_with_progress(
        &self,
        progress: Option<OnProgress>,
    ) -> Result<(), ModelError> {
        let state = self.inner.store.read().await?;
        if self.inner.is_ready_state(&state) {
            debug!(version = ?state.version, "Already ready");
            return Ok(());
        }
        self.join_or_start(progress).await
    }

    pub async fn is_ready(&self) -> Result<bool, ModelError> {
        let state = self.inner.store.read().await?;
        Ok(self.inner.is_ready_state(&state))
    }

    /// Bytes of a verified asset of the ready version
    pub async fn get_asset_handle(&self, path: &str) -> Result<Bytes, ModelError> {
        let state = self.inner.store.read().await?;
        let version = match state.version.as_deref() {
            Some(version) if self.inner.is_ready_state(&state) => version,
            _ => {
                return Err(SyncError::NotReady(self.inner.config.target_version.clone()).into());
            }
        };

        let listed = self
            .inner
            .fetcher
            .cached(version)
            .await?
            .is_some_and(|manifest| manifest.asset(path).is_some());
        if !listed {
            return Err(SyncError::NotFound(path.to_string()).into());
        }

        match self.inner.cache.get(version, path).await.map_err(SyncError::from)? {
            Some(bytes) => Ok(bytes),
            None => Err(SyncError::NotFound(path.to_string()).into()),
        }
    }

    /// React to a host lifecycle event
    pub async fn initialize(&self, reason: InitReason) -> Result<(), ModelError> {
        info!(?reason, target = %self.inner.config.target_version, "Initializing");
        self.inner.sweep_once().await;

        match reason {
            InitReason::Install | InitReason::Update => self.join_or_start(None).await,
            InitReason::Startup => self.startup().await,
        }
    }

    async fn startup(&self) -> Result<(), ModelError> {
        let state = self.inner.store.read().await?;

        if due_retry(&state, Utc::now()).is_some() {
            self.resume_pending_retry().await?;
            return Ok(());
        }
        self.inner.scheduler.rearm(&state);

        if self.inner.is_ready_state(&state) {
            if self.inner.is_complete(&state).await? {
                debug!("Ready version is complete");
                return Ok(());
            }
            warn!(version = ?state.version, "Ready version is incomplete, bootstrapping");
            return self.join_or_start(None).await;
        }

        if state.phase == Phase::Error {
            if let Some(due_at) = state.next_retry_at {
                info!(%due_at, "Retry pending, not bootstrapping now");
                return Ok(());
            }
            if let Some(err) = state.error.as_ref().filter(|e| !e.code.is_retryable()) {
                warn!(code = %err.code, "Terminal error recorded, not bootstrapping");
                return Ok(());
            }
        }

        self.join_or_start(None).await
    }

    pub async fn debug_info(&self) -> Result<DebugInfo, ModelError> {
        let state = self.inner.store.read().await?;
        let available_namespaces = self
            .inner
            .cache
            .list_namespaces()
            .await
            .map_err(SyncError::from)?;

        Ok(DebugInfo {
            state,
            target_version: self.inner.config.target_version.clone(),
            available_namespaces,
        })
    }

    /// Forget the persisted state and every cached version
    pub async fn reset(&self) -> Result<(), ModelError> {
        self.inner.store.clear().await?;

        let namespaces = self
            .inner
            .cache
            .list_namespaces()
            .await
            .map_err(SyncError::from)?;
        for namespace in &namespaces {
            self.inner
                .cache
                .delete_namespace(namespace)
                .await
                .map_err(SyncError::from)?;
        }

        info!(removed = namespaces.len(), "Reset asset store");
        Ok(())
    }

    /// Run a persisted retry whose due time has passed. Returns whether one ran.
    pub async fn resume_pending_retry(&self) -> Result<bool, ModelError> {
        let state = self.inner.store.read().await?;
        let Some(due_at) = due_retry(&state, Utc::now()) else {
            return Ok(false);
        };

        info!(%due_at, retry_count = state.retry_count, "Resuming scheduled retry");
        self.inner
            .store
            .write(StateUpdate::new().phase(Phase::Idle).next_retry_at(None))
            .await?;

        // A failed re-check of a ready version keeps `ready` set, so the
        // retry cannot go through the ready short-circuit
        self.join_or_start(None).await?;
        Ok(true)
    }

    fn join_or_start(&self, progress: Option<OnProgress>) -> AttemptFuture {
        let mut slot = self.inner.in_flight.lock();

        if let Some(flight) = slot.as_ref() {
            debug!("Joining in-flight bootstrap attempt");
            if let Some(progress) = progress {
                flight.listeners.lock().push(progress);
            }
            return flight.future.clone();
        }

        let listeners = Arc::new(Mutex::new(progress.into_iter().collect::<Vec<_>>()));
        let fanout: OnProgress = {
            let listeners = listeners.clone();
            Arc::new(move |event: ProgressEvent| {
                let current = listeners.lock().clone();
                for listener in current {
                    listener(event.clone());
                }
            })
        };

        // Spawned so the attempt completes even if every caller goes away
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = inner.attempt(&fanout).await;
            inner.in_flight.lock().take();
            result
        });

        let future = async move {
            handle.await.unwrap_or_else(|e| {
                Err(ModelError::from(&SyncError::Task(e.to_string())))
            })
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            future: future.clone(),
            listeners,
        });
        future
    }
}

impl Inner {
    fn is_ready_state(&self, state: &PersistedState) -> bool {
        state.ready && state.version.as_deref() == Some(self.config.target_version.as_str())
    }

    async fn sweep_once(&self) {
        if self.swept.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.cache.sweep().await {
            warn!(error = %e, "Failed to sweep blob cache");
        }
    }

    /// Presence check of the ready version's required assets
    async fn is_complete(&self, state: &PersistedState) -> Result<bool, SyncError> {
        let Some(version) = state.version.as_deref() else {
            return Ok(false);
        };
        match self.fetcher.cached(version).await {
            Ok(Some(manifest)) => self.required_present(&manifest).await,
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(version, error = %e, "Cached manifest unusable");
                Ok(false)
            }
        }
    }

    async fn required_present(&self, manifest: &Manifest) -> Result<bool, SyncError> {
        for asset in manifest.required_assets() {
            if !self.cache.contains(&manifest.version, &asset.path).await? {
                debug!(path = %asset.path, "Required asset missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn enter(
        &self,
        phase: Phase,
        update: StateUpdate,
        progress: &OnProgress,
    ) -> Result<PersistedState, SyncError> {
        let state = self.store.write(update.phase(phase)).await?;
        info!(%phase, "Bootstrap phase");
        progress(ProgressEvent::PhaseChanged { phase });
        Ok(state)
    }

    async fn attempt(&self, progress: &OnProgress) -> Result<(), ModelError> {
        match self.run(progress).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err, progress).await),
        }
    }

    async fn run(&self, progress: &OnProgress) -> Result<(), SyncError> {
        let target = self.config.target_version.as_str();
        let state = self
            .enter(
                Phase::Checking,
                StateUpdate::new().last_check_at(Some(Utc::now())),
                progress,
            )
            .await?;

        let manifest = match self.fetcher.fetch(target, FetchOptions::default()).await {
            Ok(manifest) => manifest,
            Err(fresh) => {
                warn!(version = target, error = %fresh, "Manifest fetch failed, trying cached copy");
                match self.fetcher.fallback(target).await {
                    Ok(manifest) => manifest,
                    Err(fallback) => {
                        debug!(error = %fallback, "No usable cached manifest");
                        return Err(fresh);
                    }
                }
            }
        };

        let unchanged = state.version.as_deref() == Some(manifest.version.as_str());
        let mut etags = state.asset_etags.clone();

        if unchanged && self.required_present(&manifest).await? {
            debug!(version = %manifest.version, "Version unchanged and complete");
        } else {
            self.enter(
                Phase::Downloading,
                StateUpdate::new().pending_version(Some(manifest.version.clone())),
                progress,
            )
            .await?;

            let report = self
                .downloader
                .download_missing(&manifest, &etags, state.version.as_deref(), Some(progress))
                .await?;
            etags = report.etags.clone();
            self.store
                .write(StateUpdate::new().asset_etags(etags.clone()))
                .await?;

            if let Some(code) = report.failure_code() {
                return Err(SyncError::RequiredAssetsFailed {
                    code,
                    paths: report.failed_paths(),
                });
            }
        }

        self.enter(Phase::Verifying, StateUpdate::new(), progress)
            .await?;
        let corrupt = self.verify(&manifest).await?;
        if !corrupt.is_empty() {
            self.store.write(StateUpdate::new().ready(false)).await?;
            return Err(SyncError::VerificationFailed(corrupt));
        }

        self.enter(
            Phase::Ready,
            StateUpdate::new()
                .version(Some(manifest.version.clone()))
                .ready(true)
                .retry_count(0)
                .error(None)
                .pending_version(None)
                .next_retry_at(None)
                .asset_etags(etags),
            progress,
        )
        .await?;

        self.prune(&manifest.version).await;
        info!(version = %manifest.version, assets = manifest.assets.len(), "Assets ready");
        Ok(())
    }

    /// Re-hash what the manifest lists. Corrupt entries are deleted; returns
    /// the required paths that are missing or were corrupt.
    async fn verify(&self, manifest: &Manifest) -> Result<Vec<String>, SyncError> {
        let namespace = manifest.version.as_str();
        let mut failed = Vec::new();

        for asset in &manifest.assets {
            match self.cache.get(namespace, &asset.path).await? {
                Some(bytes) if integrity::verify(&bytes, &asset.digest) => {}
                Some(bytes) => {
                    error!(
                        path = %asset.path,
                        expected = %asset.digest,
                        actual = %integrity::digest(&bytes),
                        "Cached asset is corrupt, deleting"
                    );
                    self.cache.delete(namespace, &asset.path).await?;
                    if !asset.optional {
                        failed.push(asset.path.clone());
                    }
                }
                None if !asset.optional => failed.push(asset.path.clone()),
                None => {}
            }
        }
        Ok(failed)
    }

    /// Drop every namespace except `keep`
    async fn prune(&self, keep: &str) {
        let namespaces = match self.cache.list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(error = %e, "Failed to list cached versions");
                return;
            }
        };

        for namespace in namespaces.iter().filter(|ns| ns.as_str() != keep) {
            match self.cache.delete_namespace(namespace).await {
                Ok(()) => info!(version = %namespace, "Removed superseded version"),
                Err(e) => warn!(version = %namespace, error = %e, "Failed to remove version"),
            }
        }
    }

    /// Persist the failure and schedule a retry when the code allows one
    async fn fail(&self, err: SyncError, progress: &OnProgress) -> ModelError {
        let model = ModelError::from(&err);
        let retryable = model.code.is_retryable();
        error!(code = %model.code, retryable, error = %err, "Bootstrap attempt failed");

        let mut update = StateUpdate::new()
            .phase(Phase::Error)
            .error(Some(model.clone()));
        if !retryable {
            update = update.next_retry_at(None);
        }
        let state = match self.store.write(update).await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Failed to persist bootstrap error");
                return model;
            }
        };
        progress(ProgressEvent::PhaseChanged { phase: Phase::Error });

        if !retryable {
            return model;
        }

        match self.scheduler.schedule_retry(state.retry_count).await {
            Ok(RetryDecision::Scheduled { .. }) => model,
            Ok(RetryDecision::Exhausted { attempts }) => {
                let exhausted = ModelError::new(
                    ErrorCode::MaxRetriesExceeded,
                    format!("{} (last error: {})", SyncError::RetriesExhausted(attempts), model),
                );
                if let Err(e) = self
                    .store
                    .write(StateUpdate::new().error(Some(exhausted.clone())))
                    .await
                {
                    error!(error = %e, "Failed to persist retry exhaustion");
                }
                exhausted
            }
            Err(e) => {
                error!(error = %e, "Failed to schedule retry");
                model
            }
        }
    }
}
