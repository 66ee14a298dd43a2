use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Stable error classification persisted alongside the bootstrap state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Transient transport failure
    Network,
    /// Manifest document failed schema validation
    MalformedManifest,
    /// Bytes do not match the digest declared by the manifest
    IntegrityMismatch,
    /// Backoff ceiling reached
    MaxRetriesExceeded,
    /// Blob cache or state store cannot be used
    StorageUnavailable,
    /// One or more required assets failed to download
    BootstrapFailed,
    /// Asset requested before the asset set is ready
    NotReady,
    /// Asset path is not part of the current manifest
    NotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Network => "NETWORK",
            ErrorCode::MalformedManifest => "MALFORMED_MANIFEST",
            ErrorCode::IntegrityMismatch => "INTEGRITY_MISMATCH",
            ErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::BootstrapFailed => "BOOTSTRAP_FAILED",
            ErrorCode::NotReady => "NOT_READY",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }

    /// Whether a failure with this code gets a backoff retry scheduled.
    ///
    /// A corrupt source does not heal by retrying and an unhealthy host
    /// environment is outside of what this engine can repair.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Network | ErrorCode::MalformedManifest | ErrorCode::BootstrapFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Internal error type raised by every engine step
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status code {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("Server answered 304 for {0} but no cached copy exists")]
    UnexpectedNotModified(String),

    #[error("Invalid URL: {0}")]
    UrlError(String),

    #[error("Invalid proxy configuration: {0}")]
    ProxyError(String),

    #[error("TLS configuration error: {0}")]
    TlsError(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("No cached manifest available for version {0}")]
    NoCachedManifest(String),

    #[error("Cached manifest for version {version} is stale ({age_secs}s old)")]
    StaleManifest { version: String, age_secs: i64 },

    #[error("Integrity mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Required assets missing or corrupt after verification: {0:?}")]
    VerificationFailed(Vec<String>),

    #[error("{} required asset(s) failed to download ({code}): {paths:?}", .paths.len())]
    RequiredAssetsFailed { code: ErrorCode, paths: Vec<String> },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Persisted state is unreadable: {0}")]
    CorruptState(String),

    #[error("Invalid cache namespace: {0}")]
    InvalidNamespace(String),

    #[error("Retry limit of {0} attempts exceeded")]
    RetriesExhausted(u32),

    #[error("Assets for version {0} are not ready")]
    NotReady(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Bootstrap task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Http(_)
            | SyncError::Status { .. }
            | SyncError::UnexpectedNotModified(_)
            | SyncError::UrlError(_)
            | SyncError::ProxyError(_)
            | SyncError::TlsError(_)
            | SyncError::NoCachedManifest(_)
            | SyncError::StaleManifest { .. } => ErrorCode::Network,
            SyncError::MalformedManifest(_) => ErrorCode::MalformedManifest,
            SyncError::IntegrityMismatch { .. } | SyncError::VerificationFailed(_) => {
                ErrorCode::IntegrityMismatch
            }
            SyncError::RequiredAssetsFailed { code, .. } => *code,
            SyncError::Task(_) => ErrorCode::BootstrapFailed,
            SyncError::Storage(_)
            | SyncError::CorruptState(_)
            | SyncError::InvalidNamespace(_) => ErrorCode::StorageUnavailable,
            SyncError::RetriesExhausted(_) => ErrorCode::MaxRetriesExceeded,
            SyncError::NotReady(_) => ErrorCode::NotReady,
            SyncError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Coarse error surfaced to callers and persisted in the bootstrap state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ModelError {
    pub code: ErrorCode,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ModelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&SyncError> for ModelError {
    fn from(err: &SyncError) -> Self {
        ModelError::new(err.code(), err.to_string())
    }
}

impl From<SyncError> for ModelError {
    fn from(err: SyncError) -> Self {
        ModelError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ErrorCode::Network.is_retryable());
        assert!(ErrorCode::MalformedManifest.is_retryable());
        assert!(!ErrorCode::IntegrityMismatch.is_retryable());
        assert!(!ErrorCode::StorageUnavailable.is_retryable());
        assert!(!ErrorCode::MaxRetriesExceeded.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        let err = SyncError::IntegrityMismatch {
            path: "a.bin".to_string(),
            expected: "00".to_string(),
            actual: "11".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::IntegrityMismatch);

        let err = SyncError::Storage(std::io::Error::other("disk gone"));
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);

        let model = ModelError::from(&SyncError::MalformedManifest("no assets".into()));
        assert_eq!(model.code, ErrorCode::MalformedManifest);
        assert!(model.message.contains("no assets"));
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::MaxRetriesExceeded).unwrap();
        assert_eq!(json, "\"MAX_RETRIES_EXCEEDED\"");
    }
}
