//! Asset sync engine.
//!
//! # Responsibility
//! - Scan partitions for assets that need upload or download.
//! - Run transfers as bounded concurrent tasks and persist every transition.
//! - Honor cooperative cancellation around process suspension.
//!
//! # Invariants
//! - At most one in-flight transfer per asset.
//! - `uploading`/`downloading` is persisted before a transfer task exists.
//! - One failing asset never aborts a scan; failures are recorded per asset.
//! - A completion write always wins over a cancellation-expiry write; expiry
//!   and failure writes only apply while the asset sequence is unchanged.
//! - A cancellation expiry is void once `retry_failed` has resumed the engine.
//! - Uploads are confirmed only when receipt size and SHA-256 match the local
//!   payload.

use crate::assets::transport::{
    AssetTransport, TransferError, TransferProgress, UploadReceipt, UploadRequest,
};
use crate::model::asset::{AssetId, MediaAsset, UploadState};
use crate::model::partition::Partition;
use crate::model::record::{now_epoch_ms, RecordId};
use crate::partition::manager::PartitionManager;
use crate::partition::store::PartitionStore;
use crate::repo::asset_repo::{AssetRepository, SqliteAssetRepository, UploadCompletion};
use crate::status::SyncStatus;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

const MAX_BACKOFF_EXPONENT: u32 = 16;
const CANCELLED_ERROR_MESSAGE: &str = "cancelled: suspended before completion";

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetSyncConfig {
    /// Directory holding local payload files.
    pub media_root: PathBuf,
    /// Cap on concurrent transfers across distinct assets.
    pub max_parallel_transfers: usize,
    /// How long `cancel_all` waits before failing unfinished transfers.
    pub cancel_grace: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed(TransferError),
}

/// Handle to one spawned transfer.
#[derive(Debug)]
pub struct TransferTicket {
    pub asset_id: AssetId,
    pub direction: TransferDirection,
    handle: JoinHandle<TransferOutcome>,
}

impl TransferTicket {
    pub async fn wait(self) -> TransferOutcome {
        self.handle
            .await
            .unwrap_or(TransferOutcome::Failed(TransferError::Interrupted))
    }
}

#[derive(Debug)]
pub enum EnqueueOutcome {
    Started(TransferTicket),
    AlreadyInFlight,
    NotNeeded,
}

/// Summary of one `retry_failed` pass.
#[derive(Debug, Default)]
pub struct RetryReport {
    pub uploads_started: usize,
    pub downloads_started: usize,
    pub skipped_in_flight: usize,
    pub skipped_backoff: usize,
    pub errors: usize,
    pub tickets: Vec<TransferTicket>,
}

impl RetryReport {
    pub fn started(&self) -> usize {
        self.uploads_started + self.downloads_started
    }

    pub async fn wait_all(self) -> Vec<TransferOutcome> {
        let mut outcomes = Vec::with_capacity(self.tickets.len());
        for ticket in self.tickets {
            outcomes.push(ticket.wait().await);
        }
        outcomes
    }
}

#[derive(Debug)]
struct InFlight {
    partition: Partition,
    direction: TransferDirection,
    sequence: i64,
    cancel: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
    expired: bool,
}

pub struct AssetSyncEngine {
    partitions: Arc<PartitionManager>,
    transport: Arc<dyn AssetTransport>,
    config: AssetSyncConfig,
    runtime: Handle,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<AssetId, InFlight>>,
    cancelled: Arc<AtomicBool>,
    /// Bumped on every resume; expiry timers armed before it are void.
    cancel_epoch: AtomicU64,
    pass_error: Mutex<Option<String>>,
    status: watch::Sender<SyncStatus>,
}

impl AssetSyncEngine {
    pub fn new(
        partitions: Arc<PartitionManager>,
        transport: Arc<dyn AssetTransport>,
        config: AssetSyncConfig,
        runtime: Handle,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel_transfers.max(1))),
            partitions,
            transport,
            config,
            runtime,
            in_flight: Mutex::new(HashMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_epoch: AtomicU64::new(0),
            pass_error: Mutex::new(None),
            status,
        }
    }

    pub fn config(&self) -> &AssetSyncConfig {
        &self.config
    }

    pub fn needs_upload(&self, asset: &MediaAsset) -> bool {
        asset.needs_upload(asset.is_locally_present(&self.config.media_root))
    }

    pub fn needs_download(&self, asset: &MediaAsset) -> bool {
        asset.needs_download(asset.is_locally_present(&self.config.media_root))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_in_flight(&self, asset_id: AssetId) -> bool {
        self.lock_in_flight().contains_key(&asset_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Persists a newly captured asset next to its Memory.
    pub fn register_asset(&self, asset: &MediaAsset) -> Result<(), TransferError> {
        let store = self.store_for(asset.partition)?;
        store.with_conn(|conn| SqliteAssetRepository::new(conn, asset.partition).create_asset(asset))?;
        Ok(())
    }

    pub fn asset_for_memory(
        &self,
        partition: Partition,
        memory_id: &RecordId,
    ) -> Result<Option<MediaAsset>, TransferError> {
        let store = self.store_for(partition)?;
        Ok(store.with_conn(|conn| {
            SqliteAssetRepository::new(conn, partition).get_asset_for_memory(memory_id)
        })?)
    }

    /// Starts an upload for `asset` unless one is running or none is needed.
    pub fn enqueue_upload(
        self: &Arc<Self>,
        asset: &MediaAsset,
    ) -> Result<EnqueueOutcome, TransferError> {
        self.enqueue(asset, TransferDirection::Upload)
    }

    /// Starts a download for `asset` unless one is running or none is needed.
    pub fn enqueue_download(
        self: &Arc<Self>,
        asset: &MediaAsset,
    ) -> Result<EnqueueOutcome, TransferError> {
        self.enqueue(asset, TransferDirection::Download)
    }

    /// Re-enqueues failed, pending and interrupted uploads plus missing downloads.
    ///
    /// Clears a previous `cancel_all` and voids its pending expiry. Safe to
    /// call repeatedly: assets with a running transfer are skipped. Downloads
    /// are picked by local presence, so purged payloads are fetched again.
    pub fn retry_failed(self: &Arc<Self>) -> RetryReport {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        let mut report = RetryReport::default();
        let now = now_epoch_ms();

        for partition in self.partitions.configured_partitions() {
            if partition == Partition::Received && !self.partitions.is_ready(partition) {
                continue;
            }
            let Some(store) = self.partitions.store(partition) else {
                continue;
            };
            let candidates = store.with_conn(|conn| {
                let repo = SqliteAssetRepository::new(conn, partition);
                let uploads = repo.list_by_upload_state(&[
                    UploadState::Failed,
                    UploadState::Pending,
                    UploadState::Uploading,
                ])?;
                Ok((uploads, repo.list_download_candidates()?))
            });
            let (uploads, downloads) = match candidates {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(
                        "event=asset_retry_scan module=assets status=error partition={} error={}",
                        partition.as_str(),
                        err
                    );
                    report.errors += 1;
                    continue;
                }
            };

            let scheduled = uploads
                .iter()
                .map(|asset| (asset, TransferDirection::Upload))
                .chain(
                    downloads
                        .iter()
                        .filter(|asset| self.needs_download(asset))
                        .map(|asset| (asset, TransferDirection::Download)),
                );
            for (asset, direction) in scheduled {
                if self.is_in_flight(asset.asset_id) {
                    report.skipped_in_flight += 1;
                    continue;
                }
                if self.in_backoff(asset, now) {
                    report.skipped_backoff += 1;
                    continue;
                }
                match self.enqueue(asset, direction) {
                    Ok(EnqueueOutcome::Started(ticket)) => {
                        match direction {
                            TransferDirection::Upload => report.uploads_started += 1,
                            TransferDirection::Download => report.downloads_started += 1,
                        }
                        report.tickets.push(ticket);
                    }
                    Ok(EnqueueOutcome::AlreadyInFlight) => report.skipped_in_flight += 1,
                    Ok(EnqueueOutcome::NotNeeded) => {}
                    Err(err) => {
                        warn!(
                            "event=asset_retry module=assets status=error direction={} partition={} asset_id={} error_code={}",
                            direction.as_str(),
                            partition.as_str(),
                            asset.asset_id,
                            err.code()
                        );
                        report.errors += 1;
                    }
                }
            }
        }

        info!(
            "event=asset_retry module=assets status=ok uploads={} downloads={} skipped_in_flight={} skipped_backoff={} errors={}",
            report.uploads_started,
            report.downloads_started,
            report.skipped_in_flight,
            report.skipped_backoff,
            report.errors
        );
        report
    }

    /// Requests cooperative cancellation of every transfer.
    ///
    /// Transfers stop at their next yield point. Whatever is still running
    /// after the grace window is marked failed so a later `retry_failed`
    /// picks it up. The returned task resolves to the number expired.
    pub fn cancel_all(self: &Arc<Self>) -> JoinHandle<usize> {
        self.cancel_all_within(self.config.cancel_grace)
    }

    /// `cancel_all` with an explicit grace window.
    pub fn cancel_all_within(self: &Arc<Self>, grace: Duration) -> JoinHandle<usize> {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        info!(
            "event=asset_cancel_all module=assets status=start in_flight={} epoch={epoch}",
            self.in_flight_count()
        );
        let engine: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            match engine.upgrade() {
                Some(engine) => engine.expire_in_flight(epoch),
                None => 0,
            }
        })
    }

    /// Fails every running transfer now and aborts its task.
    ///
    /// Aborted tasks release their partition stores. Returns the number of
    /// tasks aborted.
    pub fn abort_all(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        self.expire_in_flight(self.cancel_epoch.load(Ordering::SeqCst));
        let drained: Vec<InFlight> = self.lock_in_flight().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.store(true, Ordering::SeqCst);
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }
        if !drained.is_empty() {
            self.status.send_replace(SyncStatus::Idle);
        }
        info!(
            "event=asset_abort_all module=assets status=ok aborted={}",
            drained.len()
        );
        drained.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resets transfers a crash left mid-flight to resumable states.
    pub fn recover_interrupted(&self) -> usize {
        let mut recovered = 0;
        for partition in self.partitions.configured_partitions() {
            let Some(store) = self.partitions.store(partition) else {
                continue;
            };
            match store.with_conn(|conn| {
                SqliteAssetRepository::new(conn, partition).reset_interrupted()
            }) {
                Ok(count) => recovered += count,
                Err(err) => warn!(
                    "event=asset_recover module=assets status=error partition={} error={}",
                    partition.as_str(),
                    err
                ),
            }
        }
        info!("event=asset_recover module=assets status=ok recovered={recovered}");
        recovered
    }

    /// Removes the asset of a deleted Memory: cancels its transfer, deletes
    /// the local payload file and the asset row.
    pub async fn remove_asset_for_memory(
        &self,
        partition: Partition,
        memory_id: &RecordId,
    ) -> Result<bool, TransferError> {
        let Some(asset) = self.asset_for_memory(partition, memory_id)? else {
            return Ok(false);
        };

        let running = self
            .lock_in_flight()
            .get(&asset.asset_id)
            .map(|entry| Arc::clone(&entry.cancel));
        if let Some(cancel) = running {
            cancel.store(true, Ordering::SeqCst);
        }

        if asset.media_path.is_some() {
            match tokio::fs::remove_file(asset.local_path(&self.config.media_root)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let store = self.store_for(partition)?;
        store.with_conn(|conn| SqliteAssetRepository::new(conn, partition).delete_asset(asset.asset_id))?;
        info!(
            "event=asset_remove module=assets status=ok partition={} asset_id={}",
            partition.as_str(),
            asset.asset_id
        );
        Ok(true)
    }

    /// Runs `retry_failed` every `interval` until the engine is dropped.
    pub fn spawn_periodic_retry(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                engine.retry_failed();
            }
        })
    }

    fn enqueue(
        self: &Arc<Self>,
        asset: &MediaAsset,
        direction: TransferDirection,
    ) -> Result<EnqueueOutcome, TransferError> {
        let store = self.store_for(asset.partition)?;
        let repo_partition = asset.partition;

        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(&asset.asset_id) {
            return Ok(EnqueueOutcome::AlreadyInFlight);
        }

        let current = store
            .with_conn(|conn| SqliteAssetRepository::new(conn, repo_partition).get_asset(asset.asset_id))?
            .ok_or_else(|| TransferError::Store(format!("asset not found: {}", asset.asset_id)))?;
        let needed = match direction {
            TransferDirection::Upload => self.needs_upload(&current),
            TransferDirection::Download => self.needs_download(&current),
        };
        if !needed {
            return Ok(EnqueueOutcome::NotNeeded);
        }

        let started_at = now_epoch_ms();
        let sequence = store.with_conn(|conn| {
            let repo = SqliteAssetRepository::new(conn, repo_partition);
            match direction {
                TransferDirection::Upload => repo.mark_upload_started(current.asset_id, started_at),
                TransferDirection::Download => {
                    repo.mark_download_started(current.asset_id, started_at)
                }
            }
        })?;

        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(
            current.asset_id,
            InFlight {
                partition: repo_partition,
                direction,
                sequence,
                cancel: Arc::clone(&cancel),
                abort: None,
                expired: false,
            },
        );
        drop(in_flight);
        self.status.send_replace(SyncStatus::Syncing);

        debug!(
            "event=asset_transfer module=assets status=start direction={} partition={} asset_id={}",
            direction.as_str(),
            repo_partition.as_str(),
            current.asset_id
        );

        let engine = Arc::clone(self);
        let asset_id = current.asset_id;
        let handle = self.runtime.spawn(async move {
            engine
                .run_transfer(store, current, direction, sequence, cancel)
                .await
        });
        if let Some(entry) = self
            .lock_in_flight()
            .get_mut(&asset_id)
            .filter(|entry| entry.sequence == sequence)
        {
            entry.abort = Some(handle.abort_handle());
        }
        Ok(EnqueueOutcome::Started(TransferTicket {
            asset_id,
            direction,
            handle,
        }))
    }

    async fn run_transfer(
        self: Arc<Self>,
        store: Arc<PartitionStore>,
        asset: MediaAsset,
        direction: TransferDirection,
        sequence: i64,
        cancel: Arc<AtomicBool>,
    ) -> TransferOutcome {
        let result = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(_permit) => {
                let progress = ProgressReporter {
                    store: Arc::clone(&store),
                    asset_id: asset.asset_id,
                    global_cancel: Arc::clone(&self.cancelled),
                    asset_cancel: Arc::clone(&cancel),
                };
                match direction {
                    TransferDirection::Upload => self
                        .perform_upload(&asset, &progress)
                        .await
                        .map(Completion::Upload),
                    TransferDirection::Download => self
                        .perform_download(&asset, &progress)
                        .await
                        .map(Completion::Download),
                }
            }
            Err(_) => Err(TransferError::Interrupted),
        };
        self.finish(&store, &asset, direction, sequence, result)
    }

    async fn perform_upload(
        &self,
        asset: &MediaAsset,
        progress: &ProgressReporter,
    ) -> Result<UploadCompletion, TransferError> {
        if progress.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let payload = tokio::fs::read(asset.local_path(&self.config.media_root)).await?;
        let byte_size = payload.len() as u64;
        let local_sha256 = hex::encode(Sha256::digest(&payload));

        let receipt: UploadReceipt = self
            .transport
            .upload(
                UploadRequest {
                    asset_id: asset.asset_id,
                    memory_id: asset.memory_id.clone(),
                    partition: asset.partition,
                    payload,
                },
                progress,
            )
            .await?;

        if receipt.byte_size != byte_size {
            return Err(TransferError::Integrity {
                expected: format!("{byte_size} bytes"),
                actual: format!("{} bytes", receipt.byte_size),
            });
        }
        if !receipt.content_sha256.eq_ignore_ascii_case(&local_sha256) {
            return Err(TransferError::Integrity {
                expected: local_sha256,
                actual: receipt.content_sha256,
            });
        }

        Ok(UploadCompletion {
            remote_ref: receipt.remote_ref,
            byte_size,
            content_sha256: local_sha256,
        })
    }

    async fn perform_download(
        &self,
        asset: &MediaAsset,
        progress: &ProgressReporter,
    ) -> Result<String, TransferError> {
        if progress.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let remote_ref = asset
            .remote_ref
            .as_deref()
            .ok_or_else(|| TransferError::Store("asset has no remote reference".to_string()))?;
        let payload = self.transport.download(remote_ref, progress).await?;

        if let Some(expected) = asset.content_sha256.as_deref() {
            let actual = hex::encode(Sha256::digest(&payload));
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(TransferError::Integrity {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let file_name = asset.file_name();
        let final_path = self.config.media_root.join(&file_name);
        let partial_path = self.config.media_root.join(format!("{file_name}.part"));
        tokio::fs::create_dir_all(&self.config.media_root).await?;
        let written = match tokio::fs::write(&partial_path, &payload).await {
            Ok(()) => tokio::fs::rename(&partial_path, &final_path).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(
                        "event=asset_partial_cleanup module=assets status=error asset_id={} error={}",
                        asset.asset_id, cleanup
                    );
                }
            }
            return Err(err.into());
        }
        Ok(file_name)
    }

    fn finish(
        &self,
        store: &PartitionStore,
        asset: &MediaAsset,
        direction: TransferDirection,
        sequence: i64,
        result: Result<Completion, TransferError>,
    ) -> TransferOutcome {
        let partition = asset.partition;
        let at_ms = now_epoch_ms();
        let write = store.with_conn(|conn| {
            let repo = SqliteAssetRepository::new(conn, partition);
            match &result {
                Ok(Completion::Upload(completion)) => {
                    repo.mark_upload_succeeded(asset.asset_id, completion)
                }
                Ok(Completion::Download(media_path)) => {
                    repo.mark_download_succeeded(asset.asset_id, media_path)
                }
                Err(err) => {
                    let message = format!("{}: {err}", err.code());
                    let applied = match direction {
                        TransferDirection::Upload => {
                            repo.mark_upload_failed(asset.asset_id, &message, at_ms, sequence)?
                        }
                        TransferDirection::Download => {
                            repo.mark_download_failed(asset.asset_id, &message, at_ms, sequence)?
                        }
                    };
                    if !applied {
                        debug!(
                            "event=asset_transfer module=assets status=skip direction={} asset_id={} reason=sequence_moved",
                            direction.as_str(),
                            asset.asset_id
                        );
                    }
                    Ok(())
                }
            }
        });

        let outcome = match (result, write) {
            (Ok(_), Ok(())) => {
                info!(
                    "event=asset_transfer module=assets status=ok direction={} partition={} asset_id={}",
                    direction.as_str(),
                    partition.as_str(),
                    asset.asset_id
                );
                TransferOutcome::Completed
            }
            (Ok(_), Err(err)) | (Err(_), Err(err)) => {
                warn!(
                    "event=asset_transfer module=assets status=error direction={} partition={} asset_id={} error_code=store error={}",
                    direction.as_str(),
                    partition.as_str(),
                    asset.asset_id,
                    err
                );
                TransferOutcome::Failed(TransferError::Store(err.to_string()))
            }
            (Err(err), Ok(())) => {
                warn!(
                    "event=asset_transfer module=assets status=error direction={} partition={} asset_id={} error_code={}",
                    direction.as_str(),
                    partition.as_str(),
                    asset.asset_id,
                    err.code()
                );
                TransferOutcome::Failed(err)
            }
        };

        if let TransferOutcome::Failed(err) = &outcome {
            *self.pass_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        }

        let mut in_flight = self.lock_in_flight();
        in_flight.remove(&asset.asset_id);
        if in_flight.is_empty() {
            let status = match self
                .pass_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                Some(message) => SyncStatus::Error { message },
                None => SyncStatus::Synced { at_ms },
            };
            self.status.send_replace(status);
        }
        outcome
    }

    fn expire_in_flight(&self, epoch: u64) -> usize {
        let at_ms = now_epoch_ms();
        let mut expired = 0;
        let mut in_flight = self.lock_in_flight();
        if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
            info!("event=asset_cancel_all module=assets status=skip reason=resumed epoch={epoch}");
            return 0;
        }
        for (asset_id, entry) in in_flight.iter_mut().filter(|(_, entry)| !entry.expired) {
            let Some(store) = self.partitions.store(entry.partition) else {
                continue;
            };
            let partition = entry.partition;
            let applied = store.with_conn(|conn| {
                let repo = SqliteAssetRepository::new(conn, partition);
                match entry.direction {
                    TransferDirection::Upload => {
                        repo.mark_upload_failed(*asset_id, CANCELLED_ERROR_MESSAGE, at_ms, entry.sequence)
                    }
                    TransferDirection::Download => repo.mark_download_failed(
                        *asset_id,
                        CANCELLED_ERROR_MESSAGE,
                        at_ms,
                        entry.sequence,
                    ),
                }
            });
            entry.expired = true;
            if matches!(applied, Ok(true)) {
                expired += 1;
            }
        }
        info!("event=asset_cancel_all module=assets status=ok expired={expired}");
        expired
    }

    fn in_backoff(&self, asset: &MediaAsset, now_ms: i64) -> bool {
        if asset.upload_state != UploadState::Failed && asset.last_error.is_none() {
            return false;
        }
        let Some(last_attempt) = asset.last_attempt_at_ms else {
            return false;
        };
        let delay = backoff_delay(
            self.config.retry_backoff_base,
            self.config.retry_backoff_max,
            asset.attempt_count,
        );
        last_attempt.saturating_add(delay.as_millis() as i64) > now_ms
    }

    fn store_for(&self, partition: Partition) -> Result<Arc<PartitionStore>, TransferError> {
        self.partitions.store(partition).ok_or_else(|| {
            TransferError::Store(format!("partition `{}` is not configured", partition.as_str()))
        })
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<AssetId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Completion {
    Upload(UploadCompletion),
    Download(String),
}

/// Exponential backoff: `base * 2^(attempts - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempts - 1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent).min(max)
}

struct ProgressReporter {
    store: Arc<PartitionStore>,
    asset_id: AssetId,
    global_cancel: Arc<AtomicBool>,
    asset_cancel: Arc<AtomicBool>,
}

impl ProgressReporter {
    fn is_cancelled(&self) -> bool {
        self.global_cancel.load(Ordering::SeqCst) || self.asset_cancel.load(Ordering::SeqCst)
    }
}

impl TransferProgress for ProgressReporter {
    fn report(&self, fraction: f64) -> ControlFlow<()> {
        if self.is_cancelled() {
            return ControlFlow::Break(());
        }
        let partition = self.store.partition();
        if let Err(err) = self.store.with_conn(|conn| {
            SqliteAssetRepository::new(conn, partition).update_progress(self.asset_id, fraction)
        }) {
            debug!(
                "event=asset_progress module=assets status=error asset_id={} error={}",
                self.asset_id, err
            );
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::backoff_delay;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }
}
