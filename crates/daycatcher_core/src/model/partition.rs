//! Logical record partitions.

use serde::{Deserialize, Serialize};

/// Ownership partition a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Records created by this principal.
    Owned,
    /// Records shared with this principal by someone else.
    Received,
}

/// Remote replication scope backing a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteScope {
    /// The principal's own private database.
    Private,
    /// The shared-with-me database.
    Shared,
}

impl Partition {
    /// Every partition, in a stable order.
    pub const ALL: [Partition; 2] = [Partition::Owned, Partition::Received];

    /// Stable string id used in storage columns and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::Received => "received",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owned" => Some(Self::Owned),
            "received" => Some(Self::Received),
            _ => None,
        }
    }

    pub fn remote_scope(self) -> RemoteScope {
        match self {
            Self::Owned => RemoteScope::Private,
            Self::Received => RemoteScope::Shared,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Owned => 0,
            Self::Received => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Partition, RemoteScope};

    #[test]
    fn parse_accepts_storage_values_only() {
        assert_eq!(Partition::parse("owned"), Some(Partition::Owned));
        assert_eq!(Partition::parse("received"), Some(Partition::Received));
        assert_eq!(Partition::parse("Owned"), None);
        assert_eq!(Partition::parse(""), None);
    }

    #[test]
    fn received_partition_maps_to_shared_scope() {
        assert_eq!(Partition::Owned.remote_scope(), RemoteScope::Private);
        assert_eq!(Partition::Received.remote_scope(), RemoteScope::Shared);
    }
}
