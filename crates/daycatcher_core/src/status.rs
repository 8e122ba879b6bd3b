//! Observable sync status.

use serde::Serialize;

/// Aggregate transfer status published by the asset engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    /// Last pass finished without failures.
    Synced { at_ms: i64 },
    /// Last pass finished with at least one failure.
    Error { message: String },
}

impl SyncStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Syncing)
    }
}
