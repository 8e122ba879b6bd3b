//! Media asset model and derived sync dispositions.
//!
//! # Responsibility
//! - Define the binary payload attached 1:1 to a Memory record.
//! - Derive `needs_upload`/`needs_download`/`stable` from stored fields plus
//!   a local-presence check.
//!
//! # Invariants
//! - Local presence is never stored; callers check the filesystem.
//! - Local payloads always resolve inside the media root.
//! - Exactly one `AssetDisposition` applies for any field combination.
//! - `progress` stays within `[0, 1]`.

use crate::model::partition::Partition;
use crate::model::record::RecordId;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

pub type AssetId = Uuid;

/// Upload half of the asset state machine.
///
/// `LocalOnly` assets are never uploaded. `Uploading` left behind by a crash
/// is resumable, never a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    LocalOnly,
    Pending,
    Uploading,
    Synced,
    Failed,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local_only" => Some(Self::LocalOnly),
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Download half of the asset state machine. Failures revert to `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Absent,
    Downloading,
    Present,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Downloading => "downloading",
            Self::Present => "present",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "absent" => Some(Self::Absent),
            "downloading" => Some(Self::Downloading),
            "present" => Some(Self::Present),
            _ => None,
        }
    }
}

/// What the sync engine should do with an asset right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetDisposition {
    NeedsUpload,
    NeedsDownload,
    Stable,
}

/// Binary payload attached to one Memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub asset_id: AssetId,
    /// Owning Memory record.
    pub memory_id: RecordId,
    /// Partition of the owning Memory. Not a stored column.
    pub partition: Partition,
    /// File name relative to the media root.
    pub media_path: Option<String>,
    /// Opaque remote id, `None` until the first successful upload.
    pub remote_ref: Option<String>,
    pub upload_state: UploadState,
    pub download_state: DownloadState,
    /// Unix epoch milliseconds of the last transfer attempt.
    pub last_attempt_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub byte_size: u64,
    /// Transfer progress fraction in `[0, 1]`.
    pub progress: f64,
    /// Consecutive failed attempts, reset on success.
    pub attempt_count: u32,
    /// Hex SHA-256 of the payload once known.
    pub content_sha256: Option<String>,
    /// Per-asset write sequence, bumped on every state transition.
    pub sequence: i64,
}

impl MediaAsset {
    /// Creates a pending asset for a freshly captured payload.
    pub fn new(memory_id: RecordId, partition: Partition, media_path: impl Into<String>) -> Self {
        Self {
            asset_id: Uuid::new_v4(),
            memory_id,
            partition,
            media_path: Some(media_path.into()),
            remote_ref: None,
            upload_state: UploadState::Pending,
            download_state: DownloadState::Present,
            last_attempt_at_ms: None,
            last_error: None,
            byte_size: 0,
            progress: 0.0,
            attempt_count: 0,
            content_sha256: None,
            sequence: 0,
        }
    }

    /// Creates an asset known only remotely, e.g. from another device.
    pub fn remote(memory_id: RecordId, partition: Partition, remote_ref: impl Into<String>) -> Self {
        Self {
            remote_ref: Some(remote_ref.into()),
            upload_state: UploadState::Synced,
            download_state: DownloadState::Absent,
            media_path: None,
            ..Self::new(memory_id, partition, String::new())
        }
    }

    /// File name used for the local payload.
    ///
    /// A `media_path` that is absolute or steps outside the media root falls
    /// back to `{asset_id}.bin`.
    pub fn file_name(&self) -> String {
        match self.media_path.as_deref() {
            Some(path) if is_contained_relative(path) => path.to_string(),
            _ => format!("{}.bin", self.asset_id),
        }
    }

    pub fn local_path(&self, media_root: &Path) -> PathBuf {
        media_root.join(self.file_name())
    }

    /// Filesystem presence check for the local payload.
    pub fn is_locally_present(&self, media_root: &Path) -> bool {
        self.media_path.is_some() && self.local_path(media_root).is_file()
    }

    /// Derives the sync disposition from stored fields and local presence.
    pub fn disposition(&self, local_present: bool) -> AssetDisposition {
        match (local_present, self.remote_ref.is_some()) {
            (true, false) if self.upload_state != UploadState::LocalOnly => {
                AssetDisposition::NeedsUpload
            }
            (false, true) => AssetDisposition::NeedsDownload,
            _ => AssetDisposition::Stable,
        }
    }

    pub fn needs_upload(&self, local_present: bool) -> bool {
        self.disposition(local_present) == AssetDisposition::NeedsUpload
    }

    pub fn needs_download(&self, local_present: bool) -> bool {
        self.disposition(local_present) == AssetDisposition::NeedsDownload
    }
}

fn is_contained_relative(path: &str) -> bool {
    !path.trim().is_empty()
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}
