mod common;

use common::{memory_partitions, write_media, FakeTransport, GatedTransport};
use daycatcher_core::assets::engine::TransferOutcome;
use daycatcher_core::{
    CoreConfig, CoreError, Partition, PartitionEvent, Record, RecordId, RecordKind, RecordQuery,
    SyncCore, SyncDeps, TransferError,
};
use std::time::Duration;

fn config(media: &std::path::Path) -> CoreConfig {
    CoreConfig {
        media_dir: media.to_path_buf(),
        readiness_grace_ms: None,
        periodic_retry_interval_ms: None,
        change_coalesce_ms: 0,
        ..CoreConfig::default()
    }
}

fn deps() -> SyncDeps {
    SyncDeps {
        transport: FakeTransport::new(),
        grant_source: None,
    }
}

#[tokio::test]
async fn received_is_gated_until_marked_ready() {
    let media = tempfile::tempdir().unwrap();
    let core = SyncCore::start(config(media.path()), deps()).unwrap();
    assert!(!core.is_ready(Partition::Received));

    let shared = Record::with_id(
        RecordId::new("m-1"),
        RecordKind::Memory,
        Partition::Received,
        "from ann",
    );
    let record_ref = core.save_record(&shared).unwrap();

    assert!(!core.is_accessible(&record_ref));
    assert!(core.load(&record_ref).is_none());
    assert!(core.list(Partition::Received, &RecordQuery::default()).is_empty());

    assert!(core.partitions().mark_initial_import_complete(Partition::Received));
    assert!(!core.mark_ready(Partition::Received));
    assert!(core.is_accessible(&record_ref));
    assert_eq!(core.load(&record_ref).unwrap().title, "from ann");
    assert_eq!(core.list(Partition::Received, &RecordQuery::default()).len(), 1);
    core.shutdown();
}

#[tokio::test]
async fn owned_partition_is_never_gated() {
    let media = tempfile::tempdir().unwrap();
    let core = SyncCore::start(config(media.path()), deps()).unwrap();

    let person = Record::with_id(RecordId::new("p-1"), RecordKind::Person, Partition::Owned, "Ada");
    let record_ref = core.save_record(&person).unwrap();
    assert!(!core.is_ready(Partition::Owned));
    assert!(core.is_accessible(&record_ref));
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn readiness_grace_timer_marks_received_ready() {
    let media = tempfile::tempdir().unwrap();
    let core = SyncCore::start(
        CoreConfig {
            readiness_grace_ms: Some(5_000),
            ..config(media.path())
        },
        deps(),
    )
    .unwrap();
    let mut events = core.partitions().subscribe();

    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert!(!core.is_ready(Partition::Received));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(core.is_ready(Partition::Received));
    assert_eq!(
        events.recv().await.unwrap(),
        PartitionEvent::BecameReady(Partition::Received)
    );
    core.shutdown();
}

#[tokio::test]
async fn persistent_stores_survive_restart() {
    let media = tempfile::tempdir().unwrap();
    let stores = tempfile::tempdir().unwrap();
    let persistent = CoreConfig {
        store_dir: Some(stores.path().to_path_buf()),
        ..config(media.path())
    };

    let core = SyncCore::start(persistent.clone(), deps()).unwrap();
    let person = Record::with_id(RecordId::new("p-1"), RecordKind::Person, Partition::Owned, "Ada");
    core.save_record(&person).unwrap();
    core.shutdown();

    assert!(stores.path().join("owned.sqlite3").exists());
    assert!(stores.path().join("received.sqlite3").exists());

    let restarted = SyncCore::start(persistent, deps()).unwrap();
    let record_ref = restarted
        .record_ref(Partition::Owned, RecordId::new("p-1"))
        .unwrap();
    assert_eq!(restarted.load(&record_ref).unwrap(), person);
    restarted.shutdown();
}

#[tokio::test]
async fn unopenable_store_fails_startup() {
    let media = tempfile::tempdir().unwrap();
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let result = SyncCore::start(
        CoreConfig {
            store_dir: Some(blocker.path().to_path_buf()),
            ..config(media.path())
        },
        deps(),
    );

    assert!(matches!(result, Err(CoreError::StorageOpen { .. })));
}

#[tokio::test]
async fn invalid_config_is_rejected_before_opening_stores() {
    let result = SyncCore::start(
        CoreConfig {
            media_dir: "relative/media".into(),
            ..CoreConfig::default()
        },
        deps(),
    );

    assert!(matches!(result, Err(CoreError::Config(_))));
}

#[test]
fn startup_requires_a_tokio_runtime() {
    let media = tempfile::tempdir().unwrap();
    let result = SyncCore::start(config(media.path()), deps());

    assert!(matches!(result, Err(CoreError::RuntimeUnavailable)));
}

#[tokio::test]
async fn shutdown_detaches_outstanding_refs() {
    let media = tempfile::tempdir().unwrap();
    let core = SyncCore::start(config(media.path()), deps()).unwrap();
    let person = Record::with_id(RecordId::new("p-1"), RecordKind::Person, Partition::Owned, "Ada");
    let record_ref = core.save_record(&person).unwrap();
    assert!(record_ref.has_live_context());

    core.shutdown();

    assert!(!record_ref.has_live_context());
    assert!(!core.is_accessible(&record_ref));
    assert!(matches!(
        core.record_ref(Partition::Owned, RecordId::new("p-1")),
        Err(CoreError::PartitionNotConfigured(Partition::Owned))
    ));
}

#[tokio::test]
async fn shutdown_aborts_running_transfers() {
    let media = tempfile::tempdir().unwrap();
    let transport = GatedTransport::new();
    let core = SyncCore::start(
        config(media.path()),
        SyncDeps {
            transport: transport.clone(),
            grant_source: None,
        },
    )
    .unwrap();

    let memory = Record::with_id(RecordId::new("m-1"), RecordKind::Memory, Partition::Owned, "Beach");
    let record_ref = core.save_record(&memory).unwrap();
    write_media(media.path(), "m-1.jpg", b"payload");
    core.attach_asset(&record_ref, "m-1.jpg").unwrap();

    let report = core.on_foreground();
    assert_eq!(report.uploads_started, 1);
    for _ in 0..50 {
        if transport.entered() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.entered(), 1);

    core.shutdown();

    assert!(core.engine().is_cancelled());
    assert_eq!(core.engine().in_flight_count(), 0);
    assert_eq!(
        report.wait_all().await,
        vec![TransferOutcome::Failed(TransferError::Interrupted)]
    );
    assert!(!record_ref.has_live_context());
}

#[test]
fn configuring_twice_keeps_the_first_binding() {
    let partitions = memory_partitions();
    let before = partitions.store(Partition::Owned).unwrap();

    common::configure_memory(&partitions);

    let after = partitions.store(Partition::Owned).unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &after));
    assert_eq!(partitions.configured_partitions(), Partition::ALL.to_vec());
}
