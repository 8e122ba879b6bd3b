//! Crate-level error taxonomy.
//!
//! # Invariants
//! - `StorageOpen` is fatal: the core never runs in a degraded mode.
//! - Inaccessible refs and denied permissions are booleans, not errors.

use crate::assets::transport::TransferError;
use crate::config::ConfigError;
use crate::db::DbError;
use crate::model::partition::Partition;
use crate::repo::record_repo::RepoError;
use crate::sharing::SharingError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// Local storage for a partition could not be opened.
    StorageOpen {
        partition: Partition,
        source: DbError,
    },
    PartitionNotConfigured(Partition),
    Config(ConfigError),
    /// Background work needs a tokio runtime and none is active.
    RuntimeUnavailable,
    Repo(RepoError),
    Sharing(SharingError),
    Transfer(TransferError),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageOpen { partition, source } => write!(
                f,
                "failed to open `{}` partition store: {source}",
                partition.as_str()
            ),
            Self::PartitionNotConfigured(partition) => {
                write!(f, "partition `{}` is not configured", partition.as_str())
            }
            Self::Config(err) => write!(f, "{err}"),
            Self::RuntimeUnavailable => write!(f, "no tokio runtime is active"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Sharing(err) => write!(f, "{err}"),
            Self::Transfer(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StorageOpen { source, .. } => Some(source),
            Self::Config(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Sharing(err) => Some(err),
            Self::Transfer(err) => Some(err),
            Self::PartitionNotConfigured(_) | Self::RuntimeUnavailable => None,
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<SharingError> for CoreError {
    fn from(value: SharingError) -> Self {
        Self::Sharing(value)
    }
}

impl From<TransferError> for CoreError {
    fn from(value: TransferError) -> Self {
        Self::Transfer(value)
    }
}
