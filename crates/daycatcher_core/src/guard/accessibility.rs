//! Accessibility guard.
//!
//! # Responsibility
//! - Decide whether a `RecordRef` is safe to dereference right now.
//! - Gate every read path that surfaces records to collaborators.
//!
//! # Invariants
//! - Checks run as existence probes before any full-row dereference.
//! - `received` refs are never accessible while that partition is not ready.
//! - Inaccessibility is reported as `false`/`None`, never as an error.
//! - Cached negatives for a partition are dropped when it becomes ready.

use crate::guard::fault_shim::guard_fault;
use crate::model::partition::Partition;
use crate::model::record::{Record, RecordId, RecordRef};
use crate::partition::manager::{PartitionEvent, PartitionManager};
use crate::repo::record_repo::{
    RecordPresence, RecordQuery, RecordRepository, SqliteRecordRepository,
};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Why a ref was cached as inaccessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeReason {
    Missing,
    Tombstoned,
}

type RecordKey = (Partition, RecordId);

pub struct AccessibilityGuard {
    partitions: Arc<PartitionManager>,
    negatives: Mutex<HashMap<RecordKey, NegativeReason>>,
    revoked_roots: RwLock<HashSet<RecordId>>,
}

impl AccessibilityGuard {
    pub fn new(partitions: Arc<PartitionManager>) -> Self {
        Self {
            partitions,
            negatives: Mutex::new(HashMap::new()),
            revoked_roots: RwLock::new(HashSet::new()),
        }
    }

    /// Returns whether `record_ref` can be read without faulting.
    pub fn is_accessible(&self, record_ref: &RecordRef) -> bool {
        if !record_ref.has_live_context() {
            debug!(
                "event=access_check module=guard status=deny reason=no_context partition={}",
                record_ref.partition.as_str()
            );
            return false;
        }
        if record_ref.partition == Partition::Received
            && !self.partitions.is_ready(Partition::Received)
        {
            return false;
        }
        if record_ref.id.is_temporary() {
            return true;
        }

        let key = (record_ref.partition, record_ref.id.clone());
        if self.cached_negative(&key).is_some() {
            return false;
        }

        let Some(store) = self.partitions.store(record_ref.partition) else {
            return false;
        };
        let presence = store.with_conn(|conn| {
            SqliteRecordRepository::new(conn, record_ref.partition).record_presence(&record_ref.id)
        });

        match presence {
            Ok(RecordPresence::Live { root_id }) => !self.is_root_revoked(&root_id),
            Ok(RecordPresence::Missing) => {
                self.cache_negative(key, NegativeReason::Missing);
                false
            }
            Ok(RecordPresence::Tombstoned) => {
                self.cache_negative(key, NegativeReason::Tombstoned);
                false
            }
            Err(err) => {
                warn!(
                    "event=access_check module=guard status=error partition={} error={}",
                    record_ref.partition.as_str(),
                    err
                );
                false
            }
        }
    }

    /// Loads the record behind `record_ref` if it is accessible.
    ///
    /// The dereference runs inside the fault shim; any fault or store error
    /// surfaces as `None`.
    pub fn load_accessible(&self, record_ref: &RecordRef) -> Option<Record> {
        if !self.is_accessible(record_ref) {
            return None;
        }
        let store = self.partitions.store(record_ref.partition)?;
        let loaded = guard_fault("record_load", || {
            store.with_conn(|conn| {
                SqliteRecordRepository::new(conn, record_ref.partition).get_record(&record_ref.id)
            })
        });
        match loaded {
            Ok(Ok(Some(record))) if !record.remote_deleted => Some(record),
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                warn!(
                    "event=record_load module=guard status=error partition={} error={}",
                    record_ref.partition.as_str(),
                    err
                );
                None
            }
            Err(_) => None,
        }
    }

    /// Lists records of `partition` that are safe to surface.
    pub fn list_accessible(&self, partition: Partition, query: &RecordQuery) -> Vec<Record> {
        if partition == Partition::Received && !self.partitions.is_ready(partition) {
            return Vec::new();
        }
        let Some(store) = self.partitions.store(partition) else {
            return Vec::new();
        };
        let query = RecordQuery {
            include_remote_deleted: false,
            ..query.clone()
        };
        let fetched = guard_fault("record_list", || {
            store.with_conn(|conn| SqliteRecordRepository::new(conn, partition).fetch_records(&query))
        });
        match fetched {
            Ok(Ok(records)) => records
                .into_iter()
                .filter(|record| !self.is_root_revoked(record.root()))
                .collect(),
            Ok(Err(err)) => {
                warn!(
                    "event=record_list module=guard status=error partition={} error={}",
                    partition.as_str(),
                    err
                );
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Drops the cached negative for one record.
    pub fn invalidate_record(&self, partition: Partition, id: &RecordId) {
        self.negatives
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(partition, id.clone()));
    }

    /// Drops every cached negative for `partition`.
    pub fn invalidate_partition(&self, partition: Partition) {
        let mut negatives = self.negatives.lock().unwrap_or_else(PoisonError::into_inner);
        let before = negatives.len();
        negatives.retain(|(cached, _), _| *cached != partition);
        debug!(
            "event=guard_invalidate module=guard status=ok partition={} dropped={}",
            partition.as_str(),
            before - negatives.len()
        );
    }

    /// Stops exposing every record under `root_id` to this process.
    pub fn deny_root(&self, root_id: &RecordId) {
        self.revoked_roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root_id.clone());
    }

    pub fn allow_root(&self, root_id: &RecordId) {
        self.revoked_roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(root_id);
    }

    pub fn is_root_revoked(&self, root_id: &RecordId) -> bool {
        self.revoked_roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(root_id)
    }

    pub fn cached_negative(&self, key: &(Partition, RecordId)) -> Option<NegativeReason> {
        self.negatives
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Re-evaluates cached negatives whenever a partition becomes ready.
    pub fn spawn_readiness_listener(self: &Arc<Self>, runtime: &Handle) -> JoinHandle<()> {
        let guard: Weak<Self> = Arc::downgrade(self);
        let mut events = self.partitions.subscribe();
        runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PartitionEvent::BecameReady(partition)) => {
                        let Some(guard) = guard.upgrade() else { break };
                        guard.invalidate_partition(partition);
                    }
                    Err(RecvError::Lagged(_)) => {
                        let Some(guard) = guard.upgrade() else { break };
                        for partition in Partition::ALL {
                            guard.invalidate_partition(partition);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn cache_negative(&self, key: RecordKey, reason: NegativeReason) {
        self.negatives
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, reason);
    }
}
