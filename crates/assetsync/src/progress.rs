use std::sync::Arc;

use crate::error::ErrorCode;
use crate::state::Phase;

/// How a single asset ended up in a download batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetOutcome {
    /// Fresh bytes were fetched and committed
    Downloaded,
    /// The server answered `304` and an earlier copy was reused
    NotModified,
    /// Already present in the current namespace
    Skipped,
    Failed(ErrorCode),
}

/// Progress of a bootstrap attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The state machine entered a new phase.
    PhaseChanged { phase: Phase },
    /// A download for `path` started.
    AssetStarted { path: String },
    /// Bytes received so far for `path`.
    AssetProgress {
        path: String,
        bytes: u64,
        total: Option<u64>,
    },
    /// Work on `path` finished.
    AssetFinished { path: String, outcome: AssetOutcome },
}

/// A callback function for progress updates.
pub type OnProgress = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
