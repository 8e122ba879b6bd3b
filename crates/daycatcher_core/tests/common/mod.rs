#![allow(dead_code)]

use async_trait::async_trait;
use daycatcher_core::assets::engine::{AssetSyncConfig, AssetSyncEngine};
use daycatcher_core::{
    AssetTransport, Grant, Partition, PartitionManager, PartitionSpec, Record, RecordId,
    RecordKind, RemoteGrantSource, SharingError, StoreLocation, TransferError, TransferProgress,
    UploadReceipt, UploadRequest,
};
use daycatcher_core::repo::record_repo::{RecordRepository, SqliteRecordRepository};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// In-memory object store standing in for the remote asset service.
#[derive(Default)]
pub struct FakeTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing_uploads: AtomicUsize,
    corrupt_receipts: AtomicBool,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_uploads(&self, count: usize) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    pub fn corrupt_receipts(&self, corrupt: bool) {
        self.corrupt_receipts.store(corrupt, Ordering::SeqCst);
    }

    pub fn put_object(&self, remote_ref: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(remote_ref.to_string(), bytes.to_vec());
    }

    pub fn object(&self, remote_ref: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(remote_ref).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetTransport for FakeTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: &dyn TransferProgress,
    ) -> Result<UploadReceipt, TransferError> {
        let attempt = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        if progress.report(0.5).is_break() {
            return Err(TransferError::Cancelled);
        }
        let failing = self.failing_uploads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_uploads.store(failing - 1, Ordering::SeqCst);
            return Err(TransferError::Network("offline".to_string()));
        }

        let remote_ref = format!("rec-{}", self.objects.lock().unwrap().len() + 1);
        let content_sha256 = if self.corrupt_receipts.load(Ordering::SeqCst) {
            format!("corrupt-{attempt}")
        } else {
            sha256_hex(&request.payload)
        };
        let byte_size = request.payload.len() as u64;
        self.put_object(&remote_ref, &request.payload);
        Ok(UploadReceipt {
            remote_ref,
            byte_size,
            content_sha256,
        })
    }

    async fn download(
        &self,
        remote_ref: &str,
        progress: &dyn TransferProgress,
    ) -> Result<Vec<u8>, TransferError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if progress.report(0.5).is_break() {
            return Err(TransferError::Cancelled);
        }
        self.object(remote_ref).ok_or_else(|| TransferError::Remote {
            code: "not_found".to_string(),
            message: format!("no object {remote_ref}"),
        })
    }
}

struct IgnoreProgress;

impl TransferProgress for IgnoreProgress {
    fn report(&self, _fraction: f64) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Transport whose uploads block until the test opens the gate, then finish
/// their last chunk without looking at cancellation.
pub struct GatedTransport {
    pub inner: Arc<FakeTransport>,
    gate: Semaphore,
    entered: AtomicUsize,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: FakeTransport::new(),
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn open(&self, transfers: usize) {
        self.gate.add_permits(transfers);
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetTransport for GatedTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        _progress: &dyn TransferProgress,
    ) -> Result<UploadReceipt, TransferError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransferError::Interrupted)?;
        permit.forget();
        self.inner.upload(request, &IgnoreProgress).await
    }

    async fn download(
        &self,
        remote_ref: &str,
        _progress: &dyn TransferProgress,
    ) -> Result<Vec<u8>, TransferError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransferError::Interrupted)?;
        permit.forget();
        self.inner.download(remote_ref, &IgnoreProgress).await
    }
}

/// Remote grant query backed by a map.
#[derive(Default)]
pub struct FakeGrantSource {
    grants: Mutex<HashMap<RecordId, Grant>>,
}

impl FakeGrantSource {
    pub fn set(&self, grant: Grant) {
        self.grants
            .lock()
            .unwrap()
            .insert(grant.root_id.clone(), grant);
    }

    pub fn remove(&self, root_id: &RecordId) {
        self.grants.lock().unwrap().remove(root_id);
    }
}

#[async_trait]
impl RemoteGrantSource for FakeGrantSource {
    async fn fetch_grant(
        &self,
        _partition: Partition,
        root_id: &RecordId,
    ) -> Result<Option<Grant>, SharingError> {
        Ok(self.grants.lock().unwrap().get(root_id).cloned())
    }
}

pub fn memory_partitions() -> Arc<PartitionManager> {
    let manager = Arc::new(PartitionManager::new());
    configure_memory(&manager);
    manager
}

/// Binds fresh shared in-memory stores for every partition not yet bound.
pub fn configure_memory(manager: &PartitionManager) {
    let session = uuid::Uuid::new_v4();
    let specs = Partition::ALL
        .into_iter()
        .map(|partition| PartitionSpec {
            partition,
            location: StoreLocation::Memory(format!("test-{}-{session}", partition.as_str())),
        })
        .collect::<Vec<_>>();
    manager.configure(&specs).unwrap();
}

pub fn engine_config(media_root: &Path) -> AssetSyncConfig {
    AssetSyncConfig {
        media_root: media_root.to_path_buf(),
        max_parallel_transfers: 2,
        cancel_grace: Duration::from_millis(20),
        retry_backoff_base: Duration::ZERO,
        retry_backoff_max: Duration::ZERO,
    }
}

pub fn engine(
    partitions: &Arc<PartitionManager>,
    transport: Arc<dyn AssetTransport>,
    config: AssetSyncConfig,
) -> Arc<AssetSyncEngine> {
    Arc::new(AssetSyncEngine::new(
        Arc::clone(partitions),
        transport,
        config,
        tokio::runtime::Handle::current(),
    ))
}

pub fn seed_record(
    partitions: &PartitionManager,
    partition: Partition,
    kind: RecordKind,
    id: &str,
    root: Option<&str>,
) -> Record {
    let mut record = Record::with_id(RecordId::new(id), kind, partition, format!("title {id}"));
    if let Some(root) = root {
        record = record.under_root(RecordId::new(root));
    }
    partitions
        .store(partition)
        .unwrap()
        .with_conn(|conn| SqliteRecordRepository::new(conn, partition).save_record(&record))
        .unwrap();
    record
}

pub fn write_media(media_root: &Path, name: &str, bytes: &[u8]) {
    std::fs::create_dir_all(media_root).unwrap();
    std::fs::write(media_root.join(name), bytes).unwrap();
}
