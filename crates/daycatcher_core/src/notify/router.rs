//! Remote change notification routing.
//!
//! # Responsibility
//! - Accept remote change notifications from any thread.
//! - Coalesce bursts per partition and apply them on a background context.
//! - Republish one `DataChanged` per partition after the guard is updated.
//!
//! # Invariants
//! - Within one batch the last change per record id wins.
//! - Guard invalidation happens before `DataChanged` is published, so
//!   subscribers never re-read through a stale negative cache.
//! - A deletion tombstones the row before its asset is removed.
//! - Roots revoked for this process are never re-materialized.

use crate::assets::engine::AssetSyncEngine;
use crate::guard::accessibility::AccessibilityGuard;
use crate::model::asset::MediaAsset;
use crate::model::partition::Partition;
use crate::model::record::{Record, RecordId};
use crate::partition::manager::PartitionManager;
use crate::repo::asset_repo::{AssetRepository, SqliteAssetRepository};
use crate::repo::record_repo::{
    MergePolicy, RecordRepository, RepoError, RepoResult, SqliteRecordRepository,
};
use log::{debug, info, warn};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

const PUBLISH_CHANNEL_CAPACITY: usize = 128;

/// One change observed by the replication layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upserted {
        partition: Partition,
        record: Record,
        /// Asset metadata when the record is a Memory with media.
        asset: Option<MediaAsset>,
    },
    Deleted {
        partition: Partition,
        record_id: RecordId,
    },
    /// Everything in the partition may have changed.
    Invalidated { partition: Partition },
}

impl RemoteChange {
    fn partition(&self) -> Partition {
        match self {
            Self::Upserted { partition, .. }
            | Self::Deleted { partition, .. }
            | Self::Invalidated { partition } => *partition,
        }
    }
}

/// Thread-safe entry point for the replication layer.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<RemoteChange>,
}

impl ChangeNotifier {
    /// Queues `change`. Returns `false` once the router is gone.
    pub fn notify(&self, change: RemoteChange) -> bool {
        self.tx.send(change).is_ok()
    }
}

/// Published after a batch has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChanged {
    pub partition: Partition,
    pub upserted: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
    pub full_refresh: bool,
}

impl DataChanged {
    fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty() && !self.full_refresh
    }
}

#[derive(Default)]
struct PartitionBatch {
    order: Vec<RecordId>,
    latest: HashMap<RecordId, RemoteChange>,
    full_refresh: bool,
}

impl PartitionBatch {
    fn push(&mut self, change: RemoteChange) {
        let record_id = match &change {
            RemoteChange::Upserted { record, .. } => record.id.clone(),
            RemoteChange::Deleted { record_id, .. } => record_id.clone(),
            RemoteChange::Invalidated { .. } => {
                self.full_refresh = true;
                return;
            }
        };
        if self.latest.insert(record_id.clone(), change).is_none() {
            self.order.push(record_id);
        }
    }
}

pub struct ChangeRouter {
    rx: Mutex<mpsc::UnboundedReceiver<RemoteChange>>,
    partitions: Arc<PartitionManager>,
    guard: Arc<AccessibilityGuard>,
    engine: Arc<AssetSyncEngine>,
    merge_policy: MergePolicy,
    coalesce_window: Duration,
    published: broadcast::Sender<DataChanged>,
}

/// Creates a notifier and the router draining it.
pub fn channel(
    partitions: Arc<PartitionManager>,
    guard: Arc<AccessibilityGuard>,
    engine: Arc<AssetSyncEngine>,
    merge_policy: MergePolicy,
    coalesce_window: Duration,
) -> (ChangeNotifier, Arc<ChangeRouter>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (published, _) = broadcast::channel(PUBLISH_CHANNEL_CAPACITY);
    let router = ChangeRouter {
        rx: Mutex::new(rx),
        partitions,
        guard,
        engine,
        merge_policy,
        coalesce_window,
        published,
    };
    (ChangeNotifier { tx }, Arc::new(router))
}

impl ChangeRouter {
    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.published.subscribe()
    }

    /// Drains notifications until every notifier is dropped.
    pub fn spawn(self: &Arc<Self>, runtime: &Handle) -> JoinHandle<()> {
        let router = Arc::clone(self);
        runtime.spawn(async move { router.run().await })
    }

    pub async fn run(&self) {
        let mut rx = self.rx.lock().await;
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            if !self.coalesce_window.is_zero() {
                tokio::time::sleep(self.coalesce_window).await;
            }
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }
            self.dispatch(batch).await;
        }
        debug!("event=change_router module=notify status=ok reason=closed");
    }

    /// Applies whatever is queued right now without waiting.
    ///
    /// Must not be called while `run` owns the receiver.
    pub async fn process_pending(&self) -> usize {
        let batch = {
            let mut rx = self.rx.lock().await;
            let mut batch = Vec::new();
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }
            batch
        };
        if batch.is_empty() {
            return 0;
        }
        self.dispatch(batch).await
    }

    async fn dispatch(&self, batch: Vec<RemoteChange>) -> usize {
        let received = batch.len();
        let mut by_partition: BTreeMap<Partition, PartitionBatch> = BTreeMap::new();
        for change in batch {
            by_partition.entry(change.partition()).or_default().push(change);
        }

        let mut published = 0;
        for (partition, batch) in by_partition {
            let event = match self.apply_partition(partition, batch).await {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        "event=change_apply module=notify status=error partition={} error={}",
                        partition.as_str(),
                        err
                    );
                    continue;
                }
            };
            if event.is_empty() {
                continue;
            }
            info!(
                "event=change_publish module=notify status=ok partition={} upserted={} deleted={} full_refresh={}",
                partition.as_str(),
                event.upserted.len(),
                event.deleted.len(),
                event.full_refresh
            );
            // No subscribers is fine; the store already holds the change.
            let _ = self.published.send(event);
            published += 1;
        }
        debug!("event=change_dispatch module=notify status=ok received={received} published={published}");
        published
    }

    async fn apply_partition(
        &self,
        partition: Partition,
        mut batch: PartitionBatch,
    ) -> RepoResult<DataChanged> {
        let mut event = DataChanged {
            partition,
            upserted: Vec::new(),
            deleted: Vec::new(),
            full_refresh: batch.full_refresh,
        };
        let Some(store) = self.partitions.store(partition) else {
            debug!(
                "event=change_apply module=notify status=skip partition={} reason=not_configured",
                partition.as_str()
            );
            return Ok(event);
        };
        let conn = store.background_context()?;

        for record_id in batch.order {
            let Some(change) = batch.latest.remove(&record_id) else {
                continue;
            };
            match change {
                RemoteChange::Upserted { record, asset, .. } => {
                    match self.apply_upsert(&conn, partition, &record, asset) {
                        Ok(true) => {
                            self.guard.invalidate_record(partition, &record_id);
                            event.upserted.push(record_id);
                        }
                        Ok(false) => {}
                        Err(err) => log_apply_error(partition, &err),
                    }
                }
                RemoteChange::Deleted { .. } => {
                    match SqliteRecordRepository::new(&conn, partition).mark_remote_deleted(&record_id) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => {
                            log_apply_error(partition, &err);
                            continue;
                        }
                    }
                    if let Err(err) = self.engine.remove_asset_for_memory(partition, &record_id).await {
                        warn!(
                            "event=change_apply module=notify status=error partition={} error_code={}",
                            partition.as_str(),
                            err.code()
                        );
                    }
                    if let Err(err) =
                        SqliteRecordRepository::new(&conn, partition).delete_record(&record_id)
                    {
                        log_apply_error(partition, &err);
                    }
                    self.guard.invalidate_record(partition, &record_id);
                    event.deleted.push(record_id);
                }
                RemoteChange::Invalidated { .. } => {}
            }
        }

        if event.full_refresh {
            self.guard.invalidate_partition(partition);
        }
        Ok(event)
    }

    /// Returns whether the local row changed.
    fn apply_upsert(
        &self,
        conn: &Connection,
        partition: Partition,
        record: &Record,
        asset: Option<MediaAsset>,
    ) -> RepoResult<bool> {
        if self.guard.is_root_revoked(record.root()) {
            debug!(
                "event=change_apply module=notify status=skip partition={} reason=root_revoked",
                partition.as_str()
            );
            return Ok(false);
        }
        if !SqliteRecordRepository::new(conn, partition).apply_remote_record(record, self.merge_policy)? {
            return Ok(false);
        }
        if let Some(asset) = asset.filter(|asset| asset.memory_id == record.id) {
            SqliteAssetRepository::new(conn, partition).apply_remote_asset(&asset)?;
        }
        Ok(true)
    }
}

fn log_apply_error(partition: Partition, err: &RepoError) {
    warn!(
        "event=change_apply module=notify status=error partition={} error={}",
        partition.as_str(),
        err
    );
}

#[cfg(test)]
mod tests {
    use super::{PartitionBatch, RemoteChange};
    use crate::model::partition::Partition;
    use crate::model::record::{Record, RecordId, RecordKind};

    #[test]
    fn batch_keeps_last_change_per_record_in_first_seen_order() {
        let first = Record::with_id(RecordId::new("m-1"), RecordKind::Memory, Partition::Owned, "a");
        let second = Record::with_id(RecordId::new("m-2"), RecordKind::Memory, Partition::Owned, "b");

        let mut batch = PartitionBatch::default();
        batch.push(RemoteChange::Upserted {
            partition: Partition::Owned,
            record: first,
            asset: None,
        });
        batch.push(RemoteChange::Upserted {
            partition: Partition::Owned,
            record: second,
            asset: None,
        });
        batch.push(RemoteChange::Deleted {
            partition: Partition::Owned,
            record_id: RecordId::new("m-1"),
        });
        batch.push(RemoteChange::Invalidated {
            partition: Partition::Owned,
        });

        assert_eq!(batch.order, vec![RecordId::new("m-1"), RecordId::new("m-2")]);
        assert!(matches!(
            batch.latest.get(&RecordId::new("m-1")),
            Some(RemoteChange::Deleted { .. })
        ));
        assert!(batch.full_refresh);
    }
}
