//! Partition binding and readiness tracking.
//!
//! # Responsibility
//! - Bind one physical store per partition, once.
//! - Track per-partition readiness and broadcast when it flips.
//!
//! # Invariants
//! - Readiness starts false and is monotonic: it never reverts.
//! - `configure` is idempotent per partition; a bound store is never replaced.
//! - A store that cannot open is fatal for the caller; nothing is bound.

use crate::error::{CoreError, CoreResult};
use crate::model::partition::Partition;
use crate::partition::store::{PartitionStore, StoreLocation};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Binding request for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub partition: Partition,
    pub location: StoreLocation,
}

/// Events emitted by the partition manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEvent {
    BecameReady(Partition),
}

pub struct PartitionManager {
    stores: RwLock<BTreeMap<Partition, Arc<PartitionStore>>>,
    ready: [AtomicBool; 2],
    events: broadcast::Sender<PartitionEvent>,
}

impl Default for PartitionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stores: RwLock::new(BTreeMap::new()),
            ready: [AtomicBool::new(false), AtomicBool::new(false)],
            events,
        }
    }

    /// Binds stores for every spec not yet bound.
    ///
    /// # Errors
    /// - `CoreError::StorageOpen` when any store fails to open. Stores opened
    ///   earlier in the same call are discarded.
    pub fn configure(&self, specs: &[PartitionSpec]) -> CoreResult<()> {
        let mut opened = Vec::new();
        {
            let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
            for spec in specs {
                if let Some(existing) = stores.get(&spec.partition) {
                    if existing.location() != &spec.location {
                        warn!(
                            "event=partition_configure module=partition status=skip partition={} reason=already_bound_elsewhere",
                            spec.partition.as_str()
                        );
                    }
                    continue;
                }
                match PartitionStore::open(spec.partition, spec.location.clone()) {
                    Ok(store) => opened.push(Arc::new(store)),
                    Err(source) => {
                        error!(
                            "event=partition_configure module=partition status=error partition={} error_code=storage_open_failed error={}",
                            spec.partition.as_str(),
                            source
                        );
                        return Err(CoreError::StorageOpen {
                            partition: spec.partition,
                            source,
                        });
                    }
                }
            }
        }

        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        for store in opened {
            let partition = store.partition();
            stores.entry(partition).or_insert(store);
            info!(
                "event=partition_configure module=partition status=ok partition={} scope={:?}",
                partition.as_str(),
                partition.remote_scope()
            );
        }
        Ok(())
    }

    /// Marks `partition` ready. Returns `true` on the first call only.
    pub fn mark_ready(&self, partition: Partition) -> bool {
        let was_ready = self.ready[partition.index()].swap(true, Ordering::SeqCst);
        if was_ready {
            return false;
        }
        info!(
            "event=partition_ready module=partition status=ok partition={}",
            partition.as_str()
        );
        // No subscribers is fine; readiness is still recorded.
        let _ = self.events.send(PartitionEvent::BecameReady(partition));
        true
    }

    /// Explicit "initial import complete" signal from the platform.
    pub fn mark_initial_import_complete(&self, partition: Partition) -> bool {
        self.mark_ready(partition)
    }

    pub fn is_ready(&self, partition: Partition) -> bool {
        self.ready[partition.index()].load(Ordering::SeqCst)
    }

    /// Marks `partition` ready after a fixed grace period.
    ///
    /// The delay is a heuristic, not a confirmed round trip. An earlier
    /// explicit `mark_ready` makes the timer a no-op.
    pub fn schedule_ready_after(
        self: &Arc<Self>,
        runtime: &Handle,
        partition: Partition,
        grace: Duration,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(manager) = manager.upgrade() {
                manager.mark_ready(partition);
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    pub fn store(&self, partition: Partition) -> Option<Arc<PartitionStore>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .cloned()
    }

    pub fn require_store(&self, partition: Partition) -> CoreResult<Arc<PartitionStore>> {
        self.store(partition)
            .ok_or(CoreError::PartitionNotConfigured(partition))
    }

    pub fn configured_partitions(&self) -> Vec<Partition> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Drops every bound store; outstanding refs lose their live context.
    pub fn shutdown(&self) {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        let count = stores.len();
        stores.clear();
        info!("event=partition_shutdown module=partition status=ok stores={count}");
    }
}

#[cfg(test)]
mod tests {
    use super::{PartitionEvent, PartitionManager, PartitionSpec};
    use crate::model::partition::Partition;
    use crate::partition::store::StoreLocation;

    fn memory_spec(partition: Partition) -> PartitionSpec {
        PartitionSpec {
            partition,
            location: StoreLocation::Memory(format!(
                "manager-{}-{}",
                partition.as_str(),
                uuid::Uuid::new_v4()
            )),
        }
    }

    #[test]
    fn readiness_is_monotonic_and_emits_once() {
        let manager = PartitionManager::new();
        let mut events = manager.subscribe();

        assert!(!manager.is_ready(Partition::Received));
        assert!(manager.mark_ready(Partition::Received));
        assert!(!manager.mark_ready(Partition::Received));
        assert!(manager.is_ready(Partition::Received));
        assert!(!manager.is_ready(Partition::Owned));

        assert_eq!(
            events.try_recv().expect("ready event"),
            PartitionEvent::BecameReady(Partition::Received)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn configure_is_idempotent() {
        let manager = PartitionManager::new();
        let spec = memory_spec(Partition::Owned);
        manager
            .configure(std::slice::from_ref(&spec))
            .expect("first configure");
        let first = manager.store(Partition::Owned).expect("bound store");

        manager.configure(&[spec]).expect("second configure");
        let second = manager.store(Partition::Owned).expect("bound store");
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(manager.configured_partitions(), vec![Partition::Owned]);
    }

    #[tokio::test]
    async fn scheduled_readiness_fires_after_grace() {
        let manager = std::sync::Arc::new(PartitionManager::new());
        let handle = manager.schedule_ready_after(
            &tokio::runtime::Handle::current(),
            Partition::Received,
            std::time::Duration::from_millis(5),
        );
        handle.await.expect("timer task");
        assert!(manager.is_ready(Partition::Received));
    }
}
