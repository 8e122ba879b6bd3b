//! One physical store bound to one partition.

use crate::db::{open_db, open_db_shared_memory, DbResult};
use crate::model::partition::Partition;
use crate::model::record::{ContextToken, RecordId, RecordRef};
use crate::repo::record_repo::RepoResult;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Where a partition store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Named shared in-memory database.
    Memory(String),
}

impl StoreLocation {
    fn open(&self) -> DbResult<Connection> {
        match self {
            Self::File(path) => open_db(path),
            Self::Memory(name) => open_db_shared_memory(name),
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Memory(_) => "memory",
        }
    }
}

/// Primary (serialized writer) context for one partition.
///
/// All writes go through `with_conn`, which serializes callers on the store
/// mutex.
#[derive(Debug)]
pub struct PartitionStore {
    partition: Partition,
    location: StoreLocation,
    conn: Mutex<Connection>,
    context: Arc<ContextToken>,
}

impl PartitionStore {
    pub fn open(partition: Partition, location: StoreLocation) -> DbResult<Self> {
        let conn = location.open()?;
        log::info!(
            "event=partition_store_open module=partition status=ok partition={} mode={}",
            partition.as_str(),
            location.mode()
        );
        Ok(Self {
            partition,
            location,
            conn: Mutex::new(conn),
            context: ContextToken::new(partition),
        })
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Runs `f` against the primary connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> RepoResult<T>) -> RepoResult<T> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Opens a separate connection on the same data for background work.
    pub fn background_context(&self) -> DbResult<Connection> {
        self.location.open()
    }

    /// Binds a record id to this store's transactional context.
    pub fn record_ref(&self, id: RecordId) -> RecordRef {
        RecordRef::new(id, self.partition, &self.context)
    }
}
