//! # Assetsync
//!
//! Keeps a versioned set of large binary assets present on disk, byte-exact
//! and usable offline. A versioned manifest lists every asset with its
//! SHA-256; the engine downloads what is missing, verifies everything, and
//! recovers from partial downloads, corrupt transfers and process restarts.
//!
//! ## Features
//!
//! - Manifest retrieval with a bounded-age cached fallback
//! - Bounded-concurrency downloads with ETag-conditional re-fetch
//! - Crash-safe filesystem blob cache and state store
//! - Persisted bootstrap state machine with single-flight attempts
//! - Exponential backoff retries that survive process eviction

pub mod bootstrap;
pub mod builder;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod progress;
pub mod proxy;
pub mod retry;
pub mod state;
pub mod transport;

pub use bootstrap::{Bootstrapper, DebugInfo, InitReason};
pub use builder::SyncConfigBuilder;
pub use config::SyncConfig;
pub use error::{ErrorCode, ModelError, SyncError};

// Re-export storage seams
pub use cache::{BlobCache, FileBlobCache, MemoryBlobCache};
pub use state::{FileStateStore, MemoryStateStore, PersistedState, Phase, StateStore, StateUpdate};

// Re-export network and scheduling types
pub use manifest::{Asset, Manifest};
pub use progress::{AssetOutcome, OnProgress, ProgressEvent};
pub use retry::{ExternalWakeTimer, PollingWakeTimer, RetryPolicy, WakeTimer};
pub use transport::{FetchResponse, HttpTransport, RequestOptions, Transport, create_client};

// Re-export proxy utilities
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
