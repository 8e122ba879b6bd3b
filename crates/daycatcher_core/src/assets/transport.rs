//! Remote object-store seam for asset payloads.
//!
//! # Responsibility
//! - Define the async upload/download contract the engine drives.
//! - Define cooperative cancellation through progress yield points.
//!
//! # Invariants
//! - Transports call `TransferProgress::report` between chunks and stop with
//!   `TransferError::Cancelled` when it returns `ControlFlow::Break`.
//! - Transports never abort mid-chunk on their own.

use crate::model::asset::AssetId;
use crate::model::partition::Partition;
use crate::model::record::RecordId;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::ops::ControlFlow;

/// Yield-point callback handed to transports.
pub trait TransferProgress: Send + Sync {
    /// Reports `fraction` in `[0, 1]`; `Break` asks the transport to stop.
    fn report(&self, fraction: f64) -> ControlFlow<()>;
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub asset_id: AssetId,
    pub memory_id: RecordId,
    pub partition: Partition,
    pub payload: Vec<u8>,
}

/// What the remote store acknowledged for an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub remote_ref: String,
    pub byte_size: u64,
    /// Hex SHA-256 of the bytes the remote store persisted.
    pub content_sha256: String,
}

#[async_trait]
pub trait AssetTransport: Send + Sync {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: &dyn TransferProgress,
    ) -> Result<UploadReceipt, TransferError>;

    async fn download(
        &self,
        remote_ref: &str,
        progress: &dyn TransferProgress,
    ) -> Result<Vec<u8>, TransferError>;
}

/// Per-asset transfer failure. Recorded on the asset, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Network(String),
    Remote { code: String, message: String },
    Cancelled,
    /// Receipt did not match the local payload.
    Integrity { expected: String, actual: String },
    LocalIo(String),
    Store(String),
    /// The transfer task ended without reporting an outcome.
    Interrupted,
}

impl TransferError {
    /// Stable tag persisted alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Remote { .. } => "remote",
            Self::Cancelled => "cancelled",
            Self::Integrity { .. } => "integrity",
            Self::LocalIo(_) => "local_io",
            Self::Store(_) => "store",
            Self::Interrupted => "interrupted",
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(message) => write!(f, "network error: {message}"),
            Self::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            Self::Cancelled => write!(f, "transfer cancelled"),
            Self::Integrity { expected, actual } => {
                write!(f, "integrity mismatch: expected {expected}, got {actual}")
            }
            Self::LocalIo(message) => write!(f, "local io error: {message}"),
            Self::Store(message) => write!(f, "store error: {message}"),
            Self::Interrupted => write!(f, "transfer interrupted"),
        }
    }
}

impl Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(value: std::io::Error) -> Self {
        Self::LocalIo(value.to_string())
    }
}

impl From<crate::repo::record_repo::RepoError> for TransferError {
    fn from(value: crate::repo::record_repo::RepoError) -> Self {
        Self::Store(value.to_string())
    }
}
