//! Sync core entry point.
//!
//! # Responsibility
//! - Construct partitions, guard, engine, sharing layer and router once.
//! - Own the background tasks and stop them on shutdown.
//! - Expose the lifecycle hooks the host platform calls.
//!
//! # Invariants
//! - No component is a global singleton; everything hangs off one `SyncCore`.
//! - Startup fails as a whole when any partition store cannot open.

use crate::assets::engine::{AssetSyncEngine, RetryReport};
use crate::assets::transport::AssetTransport;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::guard::accessibility::AccessibilityGuard;
use crate::model::asset::MediaAsset;
use crate::model::partition::Partition;
use crate::model::record::{Record, RecordId, RecordRef};
use crate::notify::{self, ChangeNotifier, ChangeRouter, DataChanged};
use crate::partition::manager::{PartitionManager, PartitionSpec};
use crate::partition::store::StoreLocation;
use crate::repo::record_repo::{RecordQuery, RecordRepository, SqliteRecordRepository};
use crate::sharing::{RemoteGrantSource, SharingLayer};
use crate::status::SyncStatus;
use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Collaborators supplied by the host.
pub struct SyncDeps {
    pub transport: Arc<dyn AssetTransport>,
    pub grant_source: Option<Arc<dyn RemoteGrantSource>>,
}

pub struct SyncCore {
    config: CoreConfig,
    partitions: Arc<PartitionManager>,
    guard: Arc<AccessibilityGuard>,
    engine: Arc<AssetSyncEngine>,
    sharing: Arc<SharingLayer>,
    notifier: ChangeNotifier,
    router: Arc<ChangeRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCore {
    /// Validates `config`, opens both partition stores and starts background
    /// work on the current tokio runtime.
    ///
    /// # Errors
    /// - `CoreError::Config` for invalid config.
    /// - `CoreError::RuntimeUnavailable` outside a tokio runtime.
    /// - `CoreError::StorageOpen` when a partition store cannot open.
    pub fn start(config: CoreConfig, deps: SyncDeps) -> CoreResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| CoreError::RuntimeUnavailable)?;

        let partitions = Arc::new(PartitionManager::new());
        partitions.configure(&partition_specs(&config))?;

        let engine = Arc::new(AssetSyncEngine::new(
            Arc::clone(&partitions),
            deps.transport,
            config.asset_sync(),
            runtime.clone(),
        ));
        engine.recover_interrupted();

        let guard = Arc::new(AccessibilityGuard::new(Arc::clone(&partitions)));
        let sharing = Arc::new(SharingLayer::new(
            Arc::clone(&partitions),
            Arc::clone(&guard),
            Arc::clone(&engine),
            config.principal_id.clone(),
            deps.grant_source,
        ));
        let (notifier, router) = notify::channel(
            Arc::clone(&partitions),
            Arc::clone(&guard),
            Arc::clone(&engine),
            config.merge_policy,
            config.change_coalesce_window(),
        );

        let mut tasks = vec![
            guard.spawn_readiness_listener(&runtime),
            router.spawn(&runtime),
        ];
        if let Some(grace) = config.readiness_grace() {
            tasks.push(partitions.schedule_ready_after(&runtime, Partition::Received, grace));
        }
        if let Some(interval) = config.periodic_retry_interval() {
            tasks.push(engine.spawn_periodic_retry(interval));
        }

        info!(
            "event=sync_core_start module=core status=ok persistent={} tasks={}",
            config.store_dir.is_some(),
            tasks.len()
        );
        Ok(Self {
            config,
            partitions,
            guard,
            engine,
            sharing,
            notifier,
            router,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    pub fn guard(&self) -> &Arc<AccessibilityGuard> {
        &self.guard
    }

    pub fn engine(&self) -> &Arc<AssetSyncEngine> {
        &self.engine
    }

    pub fn sharing(&self) -> &Arc<SharingLayer> {
        &self.sharing
    }

    /// Handle the replication layer uses to report remote changes.
    pub fn notifier(&self) -> ChangeNotifier {
        self.notifier.clone()
    }

    pub fn router(&self) -> &Arc<ChangeRouter> {
        &self.router
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<DataChanged> {
        self.router.subscribe()
    }

    pub fn mark_ready(&self, partition: Partition) -> bool {
        self.partitions.mark_ready(partition)
    }

    pub fn is_ready(&self, partition: Partition) -> bool {
        self.partitions.is_ready(partition)
    }

    pub fn is_accessible(&self, record_ref: &RecordRef) -> bool {
        self.guard.is_accessible(record_ref)
    }

    pub fn load(&self, record_ref: &RecordRef) -> Option<Record> {
        self.guard.load_accessible(record_ref)
    }

    pub fn list(&self, partition: Partition, query: &RecordQuery) -> Vec<Record> {
        self.guard.list_accessible(partition, query)
    }

    pub fn is_shared(&self, record_ref: &RecordRef) -> bool {
        self.sharing.is_shared(record_ref)
    }

    pub fn can_edit(&self, record_ref: &RecordRef) -> bool {
        self.sharing.can_edit(record_ref)
    }

    pub fn is_owner(&self, record_ref: &RecordRef) -> bool {
        self.sharing.is_owner(record_ref)
    }

    pub fn needs_upload(&self, asset: &MediaAsset) -> bool {
        self.engine.needs_upload(asset)
    }

    pub fn needs_download(&self, asset: &MediaAsset) -> bool {
        self.engine.needs_download(asset)
    }

    pub fn retry_failed(&self) -> RetryReport {
        self.engine.retry_failed()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.subscribe_status()
    }

    /// Binds `id` in `partition` to the live store context.
    pub fn record_ref(&self, partition: Partition, id: RecordId) -> CoreResult<RecordRef> {
        Ok(self.partitions.require_store(partition)?.record_ref(id))
    }

    /// Writes a locally edited record through the serialized writer context.
    pub fn save_record(&self, record: &Record) -> CoreResult<RecordRef> {
        let store = self.partitions.require_store(record.partition)?;
        store.with_conn(|conn| SqliteRecordRepository::new(conn, record.partition).save_record(record))?;
        self.guard.invalidate_record(record.partition, &record.id);
        Ok(store.record_ref(record.id.clone()))
    }

    /// Registers a captured media file for a Memory; it starts as `pending`.
    pub fn attach_asset(
        &self,
        memory: &RecordRef,
        media_path: impl Into<String>,
    ) -> CoreResult<MediaAsset> {
        let asset = MediaAsset::new(memory.id.clone(), memory.partition, media_path);
        self.engine.register_asset(&asset)?;
        Ok(asset)
    }

    /// Deletes a record locally, removing its asset first.
    pub async fn delete_record(&self, record_ref: &RecordRef) -> CoreResult<bool> {
        let partition = record_ref.partition;
        self.engine
            .remove_asset_for_memory(partition, &record_ref.id)
            .await?;
        let store = self.partitions.require_store(partition)?;
        let deleted = store.with_conn(|conn| {
            SqliteRecordRepository::new(conn, partition).delete_record(&record_ref.id)
        })?;
        self.guard.invalidate_record(partition, &record_ref.id);
        Ok(deleted)
    }

    /// Connectivity came back.
    pub fn on_network_regained(&self) -> RetryReport {
        info!("event=lifecycle module=core status=ok hook=network_regained");
        self.engine.retry_failed()
    }

    pub fn on_foreground(&self) -> RetryReport {
        info!("event=lifecycle module=core status=ok hook=foreground");
        self.engine.retry_failed()
    }

    /// The host is about to suspend with `budget` of background time left.
    ///
    /// Unfinished transfers are failed within `min(budget, cancel_grace)`.
    pub fn on_suspend(&self, budget: Duration) -> JoinHandle<usize> {
        let grace = budget.min(self.config.cancel_grace());
        info!(
            "event=lifecycle module=core status=ok hook=suspend grace_ms={}",
            grace.as_millis()
        );
        self.engine.cancel_all_within(grace)
    }

    /// Stops background tasks and releases both stores.
    ///
    /// Running transfers are failed and aborted first, so outstanding
    /// `RecordRef`s lose their live context.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        self.engine.abort_all();
        self.partitions.shutdown();
        info!(
            "event=sync_core_shutdown module=core status=ok tasks={}",
            tasks.len()
        );
    }
}

fn partition_specs(config: &CoreConfig) -> Vec<PartitionSpec> {
    let session = Uuid::new_v4();
    Partition::ALL
        .into_iter()
        .map(|partition| {
            let location = match &config.store_dir {
                Some(dir) => {
                    if let Err(err) = std::fs::create_dir_all(dir) {
                        warn!(
                            "event=store_dir_create module=core status=error partition={} error={}",
                            partition.as_str(),
                            err
                        );
                    }
                    StoreLocation::File(dir.join(format!("{}.sqlite3", partition.as_str())))
                }
                None => StoreLocation::Memory(format!("{}-{session}", partition.as_str())),
            };
            PartitionSpec {
                partition,
                location,
            }
        })
        .collect()
}
