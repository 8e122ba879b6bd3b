//! Sharing and permission layer.

pub mod layer;

pub use layer::{Permissions, RemoteGrantSource, SharingLayer};

use crate::model::grant::{GrantState, GrantValidationError};
use crate::model::partition::Partition;
use crate::model::record::RecordId;
use crate::repo::record_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum SharingError {
    /// The local principal does not own the aggregate root.
    NotOwner(RecordId),
    /// No grant exists for the aggregate root.
    NotFound(RecordId),
    InvalidTransition {
        from: Option<GrantState>,
        to: GrantState,
    },
    InvalidParticipants(String),
    InvalidGrant(GrantValidationError),
    OwnerCannotLeave(RecordId),
    PartitionNotConfigured(Partition),
    /// No `RemoteGrantSource` was supplied.
    NoGrantSource,
    Remote(String),
    Repo(RepoError),
}

impl Display for SharingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOwner(root_id) => write!(f, "local principal does not own {root_id}"),
            Self::NotFound(root_id) => write!(f, "no grant for {root_id}"),
            Self::InvalidTransition { from, to } => write!(
                f,
                "illegal grant transition {} -> {}",
                from.map(GrantState::as_str).unwrap_or("none"),
                to.as_str()
            ),
            Self::InvalidParticipants(message) => write!(f, "invalid participants: {message}"),
            Self::InvalidGrant(err) => write!(f, "{err}"),
            Self::OwnerCannotLeave(root_id) => {
                write!(f, "owner cannot leave {root_id}; revoke instead")
            }
            Self::PartitionNotConfigured(partition) => {
                write!(f, "partition `{}` is not configured", partition.as_str())
            }
            Self::NoGrantSource => write!(f, "no remote grant source configured"),
            Self::Remote(message) => write!(f, "remote grant query failed: {message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SharingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidGrant(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for SharingError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::InvalidGrant(err) => Self::InvalidGrant(err),
            other => Self::Repo(other),
        }
    }
}

impl From<GrantValidationError> for SharingError {
    fn from(value: GrantValidationError) -> Self {
        Self::InvalidGrant(value)
    }
}
