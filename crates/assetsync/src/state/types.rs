use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Phase of the bootstrap state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Idle,
    Checking,
    Downloading,
    Verifying,
    Ready,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Checking => "CHECKING",
            Phase::Downloading => "DOWNLOADING",
            Phase::Verifying => "VERIFYING",
            Phase::Ready => "READY",
            Phase::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The single persisted record every bootstrap attempt resumes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    /// Last successfully verified manifest version
    pub version: Option<String>,
    pub ready: bool,
    pub phase: Phase,
    pub error: Option<ModelError>,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Version currently being downloaded
    pub pending_version: Option<String>,
    /// Asset path to the ETag last served for it
    pub asset_etags: HashMap<String, String>,
    pub retry_count: u32,
    /// Persisted due time of the next scheduled retry
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A partial update merged into [`PersistedState`]. Unset fields keep
/// their stored value.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    version: Option<Option<String>>,
    ready: Option<bool>,
    phase: Option<Phase>,
    error: Option<Option<ModelError>>,
    last_check_at: Option<Option<DateTime<Utc>>>,
    pending_version: Option<Option<String>>,
    asset_etags: Option<HashMap<String, String>>,
    retry_count: Option<u32>,
    next_retry_at: Option<Option<DateTime<Utc>>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: Option<String>) -> Self {
        self.version = Some(version);
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn error(mut self, error: Option<ModelError>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn last_check_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_check_at = Some(at);
        self
    }

    pub fn pending_version(mut self, version: Option<String>) -> Self {
        self.pending_version = Some(version);
        self
    }

    pub fn asset_etags(mut self, etags: HashMap<String, String>) -> Self {
        self.asset_etags = Some(etags);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.ready.is_none()
            && self.phase.is_none()
            && self.error.is_none()
            && self.last_check_at.is_none()
            && self.pending_version.is_none()
            && self.asset_etags.is_none()
            && self.retry_count.is_none()
            && self.next_retry_at.is_none()
    }

    /// Merge this update into `state`
    pub fn apply(self, state: &mut PersistedState) {
        if let Some(version) = self.version {
            state.version = version;
        }
        if let Some(ready) = self.ready {
            state.ready = ready;
        }
        if let Some(phase) = self.phase {
            state.phase = phase;
        }
        if let Some(error) = self.error {
            state.error = error;
        }
        if let Some(at) = self.last_check_at {
            state.last_check_at = at;
        }
        if let Some(pending) = self.pending_version {
            state.pending_version = pending;
        }
        if let Some(etags) = self.asset_etags {
            state.asset_etags = etags;
        }
        if let Some(count) = self.retry_count {
            state.retry_count = count;
        }
        if let Some(at) = self.next_retry_at {
            state.next_retry_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let mut state = PersistedState {
            version: Some("v1".into()),
            retry_count: 3,
            ..Default::default()
        };
        state.asset_etags.insert("a.bin".into(), "\"etag-a\"".into());

        StateUpdate::new().phase(Phase::Checking).apply(&mut state);

        assert_eq!(state.phase, Phase::Checking);
        assert_eq!(state.version.as_deref(), Some("v1"));
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.asset_etags.len(), 1);
    }

    #[test]
    fn test_update_can_clear_optional_fields() {
        let mut state = PersistedState {
            error: Some(ModelError::new(ErrorCode::Network, "offline")),
            pending_version: Some("v2".into()),
            ..Default::default()
        };

        StateUpdate::new()
            .error(None)
            .pending_version(None)
            .apply(&mut state);

        assert!(state.error.is_none());
        assert!(state.pending_version.is_none());
    }

    #[test]
    fn test_state_json_shape() {
        let state = PersistedState {
            version: Some("v1".into()),
            ready: true,
            phase: Phase::Ready,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "READY");
        assert_eq!(json["retryCount"], 0);
        assert!(json.get("assetEtags").is_some());

        // Older records without newer fields still load
        let loaded: PersistedState =
            serde_json::from_str(r#"{"version":"v1","ready":true,"phase":"READY"}"#).unwrap();
        assert_eq!(loaded.next_retry_at, None);
        assert!(loaded.ready);
    }
}
