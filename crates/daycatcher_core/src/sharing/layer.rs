//! Sharing state, role resolution and grant lifecycle.
//!
//! # Responsibility
//! - Answer `is_shared`, `can_edit` and `is_owner` for a record ref.
//! - Drive grants through `pending_invite -> active -> revoked`.
//! - Cascade a revocation on the receiving side.
//!
//! # Invariants
//! - Every answer is derived from the aggregate root of the record.
//! - Share intent is a separate flag; toggling it never creates a grant.
//! - Unresolvable roles deny edit and ownership.
//! - Revoked grants never count as sharing.

use crate::assets::engine::AssetSyncEngine;
use crate::guard::accessibility::AccessibilityGuard;
use crate::model::grant::{Grant, GrantState, Participant, ParticipantRole, PrincipalId};
use crate::model::partition::Partition;
use crate::model::record::{now_epoch_ms, RecordId, RecordKind, RecordRef};
use crate::partition::manager::PartitionManager;
use crate::partition::store::PartitionStore;
use crate::repo::grant_repo::{GrantRepository, SqliteGrantRepository};
use crate::repo::record_repo::{
    RecordPresence, RecordQuery, RecordRepository, SqliteRecordRepository,
};
use crate::sharing::SharingError;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

/// Remote "fetch grants" query.
#[async_trait]
pub trait RemoteGrantSource: Send + Sync {
    /// Returns the authoritative grant for `root_id`, or `None` when the
    /// remote side has none.
    async fn fetch_grant(
        &self,
        partition: Partition,
        root_id: &RecordId,
    ) -> Result<Option<Grant>, SharingError>;
}

/// Resolved sharing view of one record for the local principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub shared: bool,
    pub role: Option<ParticipantRole>,
}

impl Permissions {
    const DENIED: Self = Self {
        shared: true,
        role: None,
    };

    pub fn can_edit(&self) -> bool {
        !self.shared || self.role.is_some_and(ParticipantRole::can_edit)
    }

    pub fn is_owner(&self) -> bool {
        !self.shared || self.role == Some(ParticipantRole::Owner)
    }
}

struct ShareSnapshot {
    root_id: RecordId,
    grant: Option<Grant>,
    intent: bool,
}

impl ShareSnapshot {
    fn live_grant(&self) -> Option<&Grant> {
        self.grant.as_ref().filter(|grant| !grant.is_revoked())
    }
}

pub struct SharingLayer {
    partitions: Arc<PartitionManager>,
    guard: Arc<AccessibilityGuard>,
    engine: Arc<AssetSyncEngine>,
    principal_id: PrincipalId,
    grant_source: Option<Arc<dyn RemoteGrantSource>>,
}

impl SharingLayer {
    pub fn new(
        partitions: Arc<PartitionManager>,
        guard: Arc<AccessibilityGuard>,
        engine: Arc<AssetSyncEngine>,
        principal_id: impl Into<PrincipalId>,
        grant_source: Option<Arc<dyn RemoteGrantSource>>,
    ) -> Self {
        Self {
            partitions,
            guard,
            engine,
            principal_id: principal_id.into(),
            grant_source,
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Resolves sharing and role in one probe. Errors resolve to a shared
    /// record with no role.
    pub fn permissions(&self, record_ref: &RecordRef) -> Permissions {
        match self.snapshot(record_ref) {
            Ok(snapshot) => self.resolve(record_ref.partition, &snapshot),
            Err(err) => {
                warn!(
                    "event=permission_resolve module=sharing status=error partition={} error={}",
                    record_ref.partition.as_str(),
                    err
                );
                Permissions::DENIED
            }
        }
    }

    pub fn is_shared(&self, record_ref: &RecordRef) -> bool {
        self.permissions(record_ref).shared
    }

    pub fn can_edit(&self, record_ref: &RecordRef) -> bool {
        self.permissions(record_ref).can_edit()
    }

    pub fn is_owner(&self, record_ref: &RecordRef) -> bool {
        self.permissions(record_ref).is_owner()
    }

    /// Non-revoked grant of the record's aggregate root.
    pub fn grants_for(&self, record_ref: &RecordRef) -> Option<Grant> {
        let snapshot = self.snapshot(record_ref).ok()?;
        snapshot.grant.filter(|grant| !grant.is_revoked())
    }

    /// Toggles the share-intent flag of the record's aggregate root.
    ///
    /// # Errors
    /// - `NotOwner` when the local principal does not own the root.
    pub fn set_shared(&self, record_ref: &RecordRef, shared: bool) -> Result<(), SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        if !self.owns(record_ref.partition, &snapshot) {
            return Err(SharingError::NotOwner(snapshot.root_id));
        }
        let store = self.store_for(record_ref.partition)?;
        store.with_conn(|conn| {
            SqliteGrantRepository::new(conn).set_share_intent(&snapshot.root_id, shared)
        })?;
        info!(
            "event=share_intent module=sharing status=ok partition={} shared={}",
            record_ref.partition.as_str(),
            shared
        );
        Ok(())
    }

    /// Creates a pending invite for `participants`; the local principal is
    /// the owner.
    ///
    /// # Errors
    /// - `NotOwner` for roots in `received`.
    /// - `InvalidParticipants` when a participant claims ownership or is the
    ///   local principal.
    /// - `InvalidTransition` when a non-revoked grant already exists.
    pub fn invite(
        &self,
        record_ref: &RecordRef,
        participants: Vec<Participant>,
    ) -> Result<Grant, SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        if !self.owns(record_ref.partition, &snapshot) {
            return Err(SharingError::NotOwner(snapshot.root_id));
        }
        if participants.is_empty() {
            return Err(SharingError::InvalidParticipants(
                "at least one participant is required".to_string(),
            ));
        }
        if participants
            .iter()
            .any(|participant| participant.role == ParticipantRole::Owner)
        {
            return Err(SharingError::InvalidParticipants(
                "invitees cannot be owners".to_string(),
            ));
        }
        if participants
            .iter()
            .any(|participant| participant.principal_id == self.principal_id)
        {
            return Err(SharingError::InvalidParticipants(
                "owner cannot invite themselves".to_string(),
            ));
        }
        if let Some(existing) = snapshot.live_grant() {
            return Err(SharingError::InvalidTransition {
                from: Some(existing.state),
                to: GrantState::PendingInvite,
            });
        }

        let mut members = vec![Participant::new(
            self.principal_id.clone(),
            ParticipantRole::Owner,
        )];
        members.extend(participants);
        let grant = Grant {
            root_id: snapshot.root_id,
            state: GrantState::PendingInvite,
            participants: members,
            updated_at_ms: now_epoch_ms(),
        };
        grant.validate()?;

        let store = self.store_for(record_ref.partition)?;
        store.with_conn(|conn| SqliteGrantRepository::new(conn).put_grant(&grant))?;
        info!(
            "event=grant_invite module=sharing status=ok partition={} participants={}",
            record_ref.partition.as_str(),
            grant.participants.len() - 1
        );
        Ok(grant)
    }

    /// Moves a pending invite to `active`.
    pub fn accept_invite(&self, record_ref: &RecordRef) -> Result<Grant, SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        self.transition(record_ref.partition, snapshot, GrantState::Active)
    }

    /// Revokes the grant of a root the local principal owns and clears its
    /// share intent.
    pub fn revoke(&self, record_ref: &RecordRef) -> Result<Grant, SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        let role = snapshot
            .grant
            .as_ref()
            .and_then(|grant| grant.role_of(&self.principal_id));
        if snapshot.grant.is_some() && role != Some(ParticipantRole::Owner) {
            return Err(SharingError::NotOwner(snapshot.root_id));
        }
        let root_id = snapshot.root_id.clone();
        let grant = self.transition(record_ref.partition, snapshot, GrantState::Revoked)?;
        let store = self.store_for(record_ref.partition)?;
        store.with_conn(|conn| SqliteGrantRepository::new(conn).set_share_intent(&root_id, false))?;
        Ok(grant)
    }

    /// Leaves a root shared with the local principal, removing local copies.
    ///
    /// Returns the number of records removed.
    pub async fn leave(&self, record_ref: &RecordRef) -> Result<usize, SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        if self.resolve(record_ref.partition, &snapshot).role == Some(ParticipantRole::Owner) {
            return Err(SharingError::OwnerCannotLeave(snapshot.root_id));
        }
        let root_id = snapshot.root_id.clone();
        self.transition(record_ref.partition, snapshot, GrantState::Revoked)?;
        self.cascade_revocation(record_ref.partition, &root_id).await
    }

    /// Applies a revocation observed from the remote side.
    ///
    /// Idempotent: a missing or already revoked grant still cascades.
    pub async fn apply_remote_revocation(
        &self,
        record_ref: &RecordRef,
    ) -> Result<usize, SharingError> {
        let snapshot = self.snapshot(record_ref)?;
        if let Some(grant) = snapshot.grant.as_ref().filter(|grant| !grant.is_revoked()) {
            let store = self.store_for(record_ref.partition)?;
            store.with_conn(|conn| {
                SqliteGrantRepository::new(conn).set_grant_state(&grant.root_id, GrantState::Revoked)
            })?;
        }
        if record_ref.partition == Partition::Received {
            return self
                .cascade_revocation(record_ref.partition, &snapshot.root_id)
                .await;
        }
        Ok(0)
    }

    /// Fetches the authoritative grant for the record's root and stores it.
    ///
    /// A remote revocation of a received root cascades locally.
    pub async fn refresh_grants(
        &self,
        record_ref: &RecordRef,
    ) -> Result<Option<Grant>, SharingError> {
        let source = self
            .grant_source
            .as_ref()
            .ok_or(SharingError::NoGrantSource)?;
        let root_id = self.snapshot(record_ref)?.root_id;
        let fetched = source.fetch_grant(record_ref.partition, &root_id).await?;

        let store = self.store_for(record_ref.partition)?;
        match &fetched {
            Some(grant) => {
                if grant.root_id != root_id {
                    return Err(SharingError::Remote(format!(
                        "grant for {} returned for root {root_id}",
                        grant.root_id
                    )));
                }
                store.with_conn(|conn| SqliteGrantRepository::new(conn).put_grant(grant))?;
                if grant.is_revoked() && record_ref.partition == Partition::Received {
                    self.cascade_revocation(record_ref.partition, &root_id)
                        .await?;
                }
            }
            None => {
                store.with_conn(|conn| SqliteGrantRepository::new(conn).delete_grant(&root_id))?;
            }
        }
        info!(
            "event=grant_refresh module=sharing status=ok partition={} found={}",
            record_ref.partition.as_str(),
            fetched.is_some()
        );
        Ok(fetched)
    }

    fn transition(
        &self,
        partition: Partition,
        snapshot: ShareSnapshot,
        next: GrantState,
    ) -> Result<Grant, SharingError> {
        let Some(mut grant) = snapshot.grant else {
            return Err(SharingError::NotFound(snapshot.root_id));
        };
        if !grant.state.can_transition_to(next) {
            return Err(SharingError::InvalidTransition {
                from: Some(grant.state),
                to: next,
            });
        }
        let store = self.store_for(partition)?;
        store.with_conn(|conn| SqliteGrantRepository::new(conn).set_grant_state(&grant.root_id, next))?;
        info!(
            "event=grant_transition module=sharing status=ok partition={} from={} to={}",
            partition.as_str(),
            grant.state.as_str(),
            next.as_str()
        );
        grant.state = next;
        grant.updated_at_ms = now_epoch_ms();
        Ok(grant)
    }

    /// Removes every local record under `root_id` and denies the root.
    async fn cascade_revocation(
        &self,
        partition: Partition,
        root_id: &RecordId,
    ) -> Result<usize, SharingError> {
        self.guard.deny_root(root_id);
        let store = self.store_for(partition)?;
        let query = RecordQuery {
            root_id: Some(root_id.clone()),
            include_remote_deleted: true,
            ..RecordQuery::default()
        };
        let mut records = store
            .with_conn(|conn| SqliteRecordRepository::new(conn, partition).fetch_records(&query))?;
        // Children before the root.
        records.sort_by_key(|record| record.root_id.is_none());

        let mut removed = 0;
        for record in &records {
            if record.kind == RecordKind::Memory {
                if let Err(err) = self.engine.remove_asset_for_memory(partition, &record.id).await {
                    warn!(
                        "event=revocation_cascade module=sharing status=error partition={} error_code={}",
                        partition.as_str(),
                        err.code()
                    );
                }
            }
            let deleted = store.with_conn(|conn| {
                SqliteRecordRepository::new(conn, partition).delete_record(&record.id)
            })?;
            self.guard.invalidate_record(partition, &record.id);
            if deleted {
                removed += 1;
            }
        }
        info!(
            "event=revocation_cascade module=sharing status=ok partition={} removed={}",
            partition.as_str(),
            removed
        );
        Ok(removed)
    }

    fn resolve(&self, partition: Partition, snapshot: &ShareSnapshot) -> Permissions {
        let live_grant = snapshot.live_grant();
        let shared = partition == Partition::Received || live_grant.is_some() || snapshot.intent;
        let role = match live_grant {
            Some(grant) => grant.role_of(&self.principal_id),
            None if partition == Partition::Owned => Some(ParticipantRole::Owner),
            None => None,
        };
        Permissions { shared, role }
    }

    fn owns(&self, partition: Partition, snapshot: &ShareSnapshot) -> bool {
        self.resolve(partition, snapshot).role == Some(ParticipantRole::Owner)
    }

    fn snapshot(&self, record_ref: &RecordRef) -> Result<ShareSnapshot, SharingError> {
        let partition = record_ref.partition;
        let store = self.store_for(partition)?;
        let snapshot = store.with_conn(|conn| {
            let presence =
                SqliteRecordRepository::new(conn, partition).record_presence(&record_ref.id)?;
            let root_id = match presence {
                RecordPresence::Live { root_id } => root_id,
                RecordPresence::Missing | RecordPresence::Tombstoned => record_ref.id.clone(),
            };
            let grants = SqliteGrantRepository::new(conn);
            Ok(ShareSnapshot {
                grant: grants.get_grant(&root_id)?,
                intent: grants.share_intent(&root_id)?,
                root_id,
            })
        })?;
        Ok(snapshot)
    }

    fn store_for(&self, partition: Partition) -> Result<Arc<PartitionStore>, SharingError> {
        self.partitions
            .store(partition)
            .ok_or(SharingError::PartitionNotConfigured(partition))
    }
}

#[cfg(test)]
mod tests {
    use super::Permissions;
    use crate::model::grant::ParticipantRole;

    #[test]
    fn unshared_records_are_fully_editable() {
        let permissions = Permissions {
            shared: false,
            role: None,
        };
        assert!(permissions.can_edit());
        assert!(permissions.is_owner());
    }

    #[test]
    fn shared_records_follow_role() {
        let read_only = Permissions {
            shared: true,
            role: Some(ParticipantRole::ReadOnly),
        };
        assert!(!read_only.can_edit());
        assert!(!read_only.is_owner());

        let read_write = Permissions {
            shared: true,
            role: Some(ParticipantRole::ReadWrite),
        };
        assert!(read_write.can_edit());
        assert!(!read_write.is_owner());

        assert!(!Permissions::DENIED.can_edit());
        assert!(!Permissions::DENIED.is_owner());
    }
}
