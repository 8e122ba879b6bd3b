mod common;

use common::{
    engine, engine_config, memory_partitions, seed_record, write_media, FakeGrantSource,
    FakeTransport,
};
use daycatcher_core::repo::asset_repo::{AssetRepository, SqliteAssetRepository};
use daycatcher_core::repo::grant_repo::{GrantRepository, SqliteGrantRepository};
use daycatcher_core::repo::record_repo::{RecordPresence, RecordRepository, SqliteRecordRepository};
use daycatcher_core::{
    AccessibilityGuard, Grant, GrantState, MediaAsset, Participant, ParticipantRole, Partition,
    PartitionManager, RecordId, RecordKind, RecordRef, RemoteGrantSource, SharingError,
    SharingLayer,
};
use std::path::Path;
use std::sync::Arc;

const LOCAL: &str = "ann";

struct Fixture {
    partitions: Arc<PartitionManager>,
    guard: Arc<AccessibilityGuard>,
    sharing: SharingLayer,
}

fn fixture(media_root: &Path, grant_source: Option<Arc<dyn RemoteGrantSource>>) -> Fixture {
    let partitions = memory_partitions();
    partitions.mark_ready(Partition::Received);
    let guard = Arc::new(AccessibilityGuard::new(Arc::clone(&partitions)));
    let engine = engine(&partitions, FakeTransport::new(), engine_config(media_root));
    let sharing = SharingLayer::new(
        Arc::clone(&partitions),
        Arc::clone(&guard),
        engine,
        LOCAL,
        grant_source,
    );
    Fixture {
        partitions,
        guard,
        sharing,
    }
}

impl Fixture {
    fn bound(&self, partition: Partition, id: &str) -> RecordRef {
        self.partitions
            .store(partition)
            .unwrap()
            .record_ref(RecordId::new(id))
    }

    fn put_grant(&self, partition: Partition, grant: &Grant) {
        self.partitions
            .store(partition)
            .unwrap()
            .with_conn(|conn| SqliteGrantRepository::new(conn).put_grant(grant))
            .unwrap();
    }

    fn stored_grant(&self, partition: Partition, root: &str) -> Option<Grant> {
        self.partitions
            .store(partition)
            .unwrap()
            .with_conn(|conn| SqliteGrantRepository::new(conn).get_grant(&RecordId::new(root)))
            .unwrap()
    }

    fn presence(&self, partition: Partition, id: &str) -> RecordPresence {
        self.partitions
            .store(partition)
            .unwrap()
            .with_conn(|conn| {
                SqliteRecordRepository::new(conn, partition).record_presence(&RecordId::new(id))
            })
            .unwrap()
    }
}

fn received_grant(root: &str, local_role: ParticipantRole, state: GrantState) -> Grant {
    Grant {
        root_id: RecordId::new(root),
        state,
        participants: vec![
            Participant::new("bob", ParticipantRole::Owner),
            Participant::new(LOCAL, local_role),
        ],
        updated_at_ms: 1,
    }
}

#[tokio::test]
async fn unshared_owned_records_are_fully_editable() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);
    let record_ref = fx.bound(Partition::Owned, "p-1");

    assert!(!fx.sharing.is_shared(&record_ref));
    assert!(fx.sharing.can_edit(&record_ref));
    assert!(fx.sharing.is_owner(&record_ref));
    assert!(fx.sharing.grants_for(&record_ref).is_none());
}

#[tokio::test]
async fn share_intent_toggles_without_creating_grants() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Memory, "m-1", Some("p-1"));
    let root = fx.bound(Partition::Owned, "p-1");
    let child = fx.bound(Partition::Owned, "m-1");

    fx.sharing.set_shared(&child, true).unwrap();
    assert!(fx.sharing.is_shared(&root));
    assert!(fx.sharing.is_shared(&child));
    assert!(fx.sharing.can_edit(&child));
    assert!(fx.sharing.is_owner(&child));

    fx.sharing.set_shared(&root, false).unwrap();
    assert!(!fx.sharing.is_shared(&child));

    fx.sharing.set_shared(&root, true).unwrap();
    assert!(fx.sharing.is_shared(&root));
    assert!(fx.sharing.grants_for(&root).is_none());
    assert!(fx.stored_grant(Partition::Owned, "p-1").is_none());
}

#[tokio::test]
async fn grant_lifecycle_follows_legal_transitions() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);
    let root = fx.bound(Partition::Owned, "p-1");

    assert!(matches!(
        fx.sharing.accept_invite(&root),
        Err(SharingError::NotFound(_))
    ));

    let invited = fx
        .sharing
        .invite(&root, vec![Participant::new("bob", ParticipantRole::ReadOnly)])
        .unwrap();
    assert_eq!(invited.state, GrantState::PendingInvite);
    assert_eq!(invited.owner().unwrap().principal_id, LOCAL);
    assert!(fx.sharing.is_shared(&root));
    assert!(fx.sharing.is_owner(&root));
    assert!(matches!(
        fx.sharing
            .invite(&root, vec![Participant::new("cy", ParticipantRole::ReadWrite)]),
        Err(SharingError::InvalidTransition {
            from: Some(GrantState::PendingInvite),
            to: GrantState::PendingInvite
        })
    ));

    assert_eq!(
        fx.sharing.accept_invite(&root).unwrap().state,
        GrantState::Active
    );
    assert!(matches!(
        fx.sharing.accept_invite(&root),
        Err(SharingError::InvalidTransition {
            from: Some(GrantState::Active),
            to: GrantState::Active
        })
    ));

    fx.sharing.set_shared(&root, true).unwrap();
    assert_eq!(
        fx.sharing.revoke(&root).unwrap().state,
        GrantState::Revoked
    );
    assert!(!fx.sharing.is_shared(&root));
    assert!(fx.sharing.grants_for(&root).is_none());
    assert!(matches!(
        fx.sharing.revoke(&root),
        Err(SharingError::InvalidTransition {
            from: Some(GrantState::Revoked),
            to: GrantState::Revoked
        })
    ));

    let reinvited = fx
        .sharing
        .invite(&root, vec![Participant::new("cy", ParticipantRole::ReadWrite)])
        .unwrap();
    assert_eq!(reinvited.state, GrantState::PendingInvite);
    assert_eq!(reinvited.role_of("bob"), None);
}

#[tokio::test]
async fn invites_reject_bad_participants() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Person, "p-9", None);
    let root = fx.bound(Partition::Owned, "p-1");

    for participants in [
        Vec::new(),
        vec![Participant::new("bob", ParticipantRole::Owner)],
        vec![Participant::new(LOCAL, ParticipantRole::ReadWrite)],
    ] {
        assert!(matches!(
            fx.sharing.invite(&root, participants),
            Err(SharingError::InvalidParticipants(_))
        ));
    }
    assert!(matches!(
        fx.sharing.invite(
            &root,
            vec![
                Participant::new("bob", ParticipantRole::ReadOnly),
                Participant::new("bob", ParticipantRole::ReadWrite),
            ]
        ),
        Err(SharingError::InvalidGrant(_))
    ));

    let received = fx.bound(Partition::Received, "p-9");
    assert!(matches!(
        fx.sharing
            .invite(&received, vec![Participant::new("cy", ParticipantRole::ReadOnly)]),
        Err(SharingError::NotOwner(_))
    ));
    assert!(matches!(
        fx.sharing.set_shared(&received, true),
        Err(SharingError::NotOwner(_))
    ));
}

#[tokio::test]
async fn received_records_resolve_role_from_their_grant() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Memory, "m-1", Some("p-1"));
    let child = fx.bound(Partition::Received, "m-1");

    // Without a grant the role cannot be resolved: shared and read-only.
    assert!(fx.sharing.is_shared(&child));
    assert!(!fx.sharing.can_edit(&child));
    assert!(!fx.sharing.is_owner(&child));

    fx.put_grant(
        Partition::Received,
        &received_grant("p-1", ParticipantRole::ReadOnly, GrantState::Active),
    );
    let permissions = fx.sharing.permissions(&child);
    assert!(permissions.shared);
    assert_eq!(permissions.role, Some(ParticipantRole::ReadOnly));
    assert!(!fx.sharing.can_edit(&child));

    fx.put_grant(
        Partition::Received,
        &received_grant("p-1", ParticipantRole::ReadWrite, GrantState::Active),
    );
    assert!(fx.sharing.can_edit(&child));
    assert!(!fx.sharing.is_owner(&child));
    assert_eq!(
        fx.sharing.grants_for(&child).unwrap().owner().unwrap().principal_id,
        "bob"
    );

    assert!(matches!(
        fx.sharing.revoke(&child),
        Err(SharingError::NotOwner(_))
    ));
}

#[tokio::test]
async fn leaving_a_received_root_removes_local_copies() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Memory, "m-1", Some("p-1"));
    seed_record(&fx.partitions, Partition::Received, RecordKind::Memory, "m-9", None);
    write_media(media.path(), "m-1.jpg", b"shared photo");
    let asset = MediaAsset::new(RecordId::new("m-1"), Partition::Received, "m-1.jpg");
    fx.partitions
        .store(Partition::Received)
        .unwrap()
        .with_conn(|conn| {
            SqliteAssetRepository::new(conn, Partition::Received).create_asset(&asset)
        })
        .unwrap();
    fx.put_grant(
        Partition::Received,
        &received_grant("p-1", ParticipantRole::ReadWrite, GrantState::Active),
    );

    let child = fx.bound(Partition::Received, "m-1");
    assert_eq!(fx.sharing.leave(&child).await.unwrap(), 2);

    assert_eq!(fx.presence(Partition::Received, "p-1"), RecordPresence::Missing);
    assert_eq!(fx.presence(Partition::Received, "m-1"), RecordPresence::Missing);
    assert!(matches!(
        fx.presence(Partition::Received, "m-9"),
        RecordPresence::Live { .. }
    ));
    assert!(!media.path().join("m-1.jpg").exists());
    assert!(fx.guard.is_root_revoked(&RecordId::new("p-1")));
    assert!(!fx.guard.is_accessible(&child));
    assert_eq!(
        fx.stored_grant(Partition::Received, "p-1").unwrap().state,
        GrantState::Revoked
    );
}

#[tokio::test]
async fn owners_cannot_leave() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);
    let root = fx.bound(Partition::Owned, "p-1");
    fx.sharing
        .invite(&root, vec![Participant::new("bob", ParticipantRole::ReadOnly)])
        .unwrap();

    assert!(matches!(
        fx.sharing.leave(&root).await,
        Err(SharingError::OwnerCannotLeave(_))
    ));
}

#[tokio::test]
async fn remote_revocation_cascades_even_without_local_grant() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Event, "e-1", Some("p-1"));
    let root = fx.bound(Partition::Received, "p-1");

    assert_eq!(fx.sharing.apply_remote_revocation(&root).await.unwrap(), 2);
    assert_eq!(fx.presence(Partition::Received, "e-1"), RecordPresence::Missing);
    assert_eq!(fx.sharing.apply_remote_revocation(&root).await.unwrap(), 0);
}

#[tokio::test]
async fn refresh_grants_tracks_the_remote_answer() {
    let media = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeGrantSource::default());
    let fx = fixture(
        media.path(),
        Some(Arc::clone(&source) as Arc<dyn RemoteGrantSource>),
    );
    seed_record(&fx.partitions, Partition::Received, RecordKind::Person, "p-1", None);
    seed_record(&fx.partitions, Partition::Received, RecordKind::Memory, "m-1", Some("p-1"));
    let child = fx.bound(Partition::Received, "m-1");

    source.set(received_grant("p-1", ParticipantRole::ReadWrite, GrantState::Active));
    let fetched = fx.sharing.refresh_grants(&child).await.unwrap().unwrap();
    assert_eq!(fetched.state, GrantState::Active);
    assert!(fx.sharing.can_edit(&child));

    source.remove(&RecordId::new("p-1"));
    assert!(fx.sharing.refresh_grants(&child).await.unwrap().is_none());
    assert!(fx.stored_grant(Partition::Received, "p-1").is_none());
    assert!(!fx.sharing.can_edit(&child));

    source.set(received_grant("p-1", ParticipantRole::ReadWrite, GrantState::Revoked));
    fx.sharing.refresh_grants(&child).await.unwrap();
    assert_eq!(fx.presence(Partition::Received, "m-1"), RecordPresence::Missing);
    assert!(fx.guard.is_root_revoked(&RecordId::new("p-1")));
}

#[tokio::test]
async fn refresh_without_source_is_an_error() {
    let media = tempfile::tempdir().unwrap();
    let fx = fixture(media.path(), None);
    seed_record(&fx.partitions, Partition::Owned, RecordKind::Person, "p-1", None);

    assert!(matches!(
        fx.sharing.refresh_grants(&fx.bound(Partition::Owned, "p-1")).await,
        Err(SharingError::NoGrantSource)
    ));
}
