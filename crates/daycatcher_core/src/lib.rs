//! Offline-first sync core for Daycatcher.
//! Keeps records and media consistent between the on-device store and the
//! remote store, gated by partition readiness and sharing permissions.

pub mod assets;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod logging;
pub mod model;
pub mod notify;
pub mod partition;
pub mod repo;
pub mod sharing;
pub mod status;
pub mod sync_core;

pub use assets::engine::{
    AssetSyncConfig, AssetSyncEngine, EnqueueOutcome, RetryReport, TransferDirection,
    TransferOutcome, TransferTicket,
};
pub use assets::transport::{
    AssetTransport, TransferError, TransferProgress, UploadReceipt, UploadRequest,
};
pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, CoreResult};
pub use guard::accessibility::AccessibilityGuard;
pub use guard::fault_shim::{guard_fault, FaultError};
pub use logging::{init_logging, logging_status, LogLevel, LoggingConfig, LoggingError};
pub use model::asset::{AssetId, DownloadState, MediaAsset, UploadState};
pub use model::grant::{Grant, GrantState, Participant, ParticipantRole, PrincipalId};
pub use model::partition::{Partition, RemoteScope};
pub use model::record::{Record, RecordId, RecordKind, RecordRef};
pub use notify::{ChangeNotifier, ChangeRouter, DataChanged, RemoteChange};
pub use partition::manager::{PartitionEvent, PartitionManager, PartitionSpec};
pub use partition::store::{PartitionStore, StoreLocation};
pub use repo::record_repo::{MergePolicy, RecordQuery, RepoError, RepoResult};
pub use sharing::{Permissions, RemoteGrantSource, SharingError, SharingLayer};
pub use status::SyncStatus;
pub use sync_core::{SyncCore, SyncDeps};

/// Minimal health-check API for host integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
