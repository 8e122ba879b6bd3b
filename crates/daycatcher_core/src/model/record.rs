//! Structured record model.
//!
//! # Responsibility
//! - Define the record shape shared by Person/Memory/Event/Tag entities.
//! - Define `RecordRef`, the handle collaborators hold between reads.
//!
//! # Invariants
//! - `id` is opaque and never reused for another record.
//! - `partition` is fixed at creation; moving a record means delete + recreate.
//! - A record never names itself as its aggregate root.

use crate::model::partition::Partition;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};
use uuid::Uuid;

const TEMPORARY_ID_PREFIX: &str = "tmp-";

/// Opaque stable record identifier.
///
/// Locally created records carry a temporary id until the replication layer
/// assigns a permanent one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh temporary id for a not-yet-synced record.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Person,
    Memory,
    Event,
    Tag,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Memory => "memory",
            Self::Event => "event",
            Self::Tag => "tag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "person" => Some(Self::Person),
            "memory" => Some(Self::Memory),
            "event" => Some(Self::Event),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

/// Canonical structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    /// Home partition, assigned at creation.
    pub partition: Partition,
    /// Aggregate root this record belongs to. `None` means the record is a root.
    pub root_id: Option<RecordId>,
    /// Display title. Free text produced by the user or by opaque producers.
    pub title: String,
    /// Set when a remote deletion was observed but the row is still present.
    pub remote_deleted: bool,
    /// Unix epoch milliseconds.
    pub created_at_ms: i64,
    /// Unix epoch milliseconds.
    pub updated_at_ms: i64,
}

impl Record {
    /// Creates a root record with a temporary id in `partition`.
    pub fn new(kind: RecordKind, partition: Partition, title: impl Into<String>) -> Self {
        Self::with_id(RecordId::temporary(), kind, partition, title)
    }

    pub fn with_id(
        id: RecordId,
        kind: RecordKind,
        partition: Partition,
        title: impl Into<String>,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            id,
            kind,
            partition,
            root_id: None,
            title: title.into(),
            remote_deleted: false,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Attaches this record under aggregate root `root`.
    pub fn under_root(mut self, root: RecordId) -> Self {
        self.root_id = Some(root);
        self
    }

    /// Aggregate root id; a root record is its own root.
    pub fn root(&self) -> &RecordId {
        self.root_id.as_ref().unwrap_or(&self.id)
    }

    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(RecordValidationError::EmptyId);
        }
        if self.root_id.as_ref() == Some(&self.id) {
            return Err(RecordValidationError::SelfRootReference(self.id.clone()));
        }
        if self.updated_at_ms < self.created_at_ms {
            return Err(RecordValidationError::UpdatedBeforeCreated {
                created_at_ms: self.created_at_ms,
                updated_at_ms: self.updated_at_ms,
            });
        }
        Ok(())
    }
}

/// Record validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    EmptyId,
    SelfRootReference(RecordId),
    UpdatedBeforeCreated {
        created_at_ms: i64,
        updated_at_ms: i64,
    },
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "record id must not be empty"),
            Self::SelfRootReference(id) => write!(f, "record {id} names itself as root"),
            Self::UpdatedBeforeCreated {
                created_at_ms,
                updated_at_ms,
            } => write!(
                f,
                "record updated_at {updated_at_ms} is earlier than created_at {created_at_ms}"
            ),
        }
    }
}

impl Error for RecordValidationError {}

/// Liveness token owned by one open partition store.
///
/// Record refs hold a weak pointer to it; once the store is dropped every
/// outstanding ref loses its transactional context.
#[derive(Debug)]
pub struct ContextToken {
    partition: Partition,
}

impl ContextToken {
    pub(crate) fn new(partition: Partition) -> Arc<Self> {
        Arc::new(Self { partition })
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }
}

/// Handle to a record as seen by collaborators between reads.
#[derive(Debug, Clone)]
pub struct RecordRef {
    pub id: RecordId,
    pub partition: Partition,
    context: Weak<ContextToken>,
}

impl RecordRef {
    pub(crate) fn new(id: RecordId, partition: Partition, context: &Arc<ContextToken>) -> Self {
        Self {
            id,
            partition,
            context: Arc::downgrade(context),
        }
    }

    /// A ref that was never bound to a store.
    pub fn detached(id: RecordId, partition: Partition) -> Self {
        Self {
            id,
            partition,
            context: Weak::new(),
        }
    }

    pub fn has_live_context(&self) -> bool {
        self.context.strong_count() > 0
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
