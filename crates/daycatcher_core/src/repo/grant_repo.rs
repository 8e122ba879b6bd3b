//! Grant and share-intent persistence.
//!
//! # Invariants
//! - `put_grant` replaces the participant set atomically.
//! - Share intent is stored separately; it never implies a grant row.

use crate::model::grant::{Grant, GrantState, Participant, ParticipantRole};
use crate::model::record::{now_epoch_ms, RecordId};
use crate::repo::record_repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};

pub trait GrantRepository {
    fn get_grant(&self, root_id: &RecordId) -> RepoResult<Option<Grant>>;
    fn put_grant(&self, grant: &Grant) -> RepoResult<()>;
    fn set_grant_state(&self, root_id: &RecordId, state: GrantState) -> RepoResult<()>;
    fn delete_grant(&self, root_id: &RecordId) -> RepoResult<bool>;
    fn share_intent(&self, root_id: &RecordId) -> RepoResult<bool>;
    fn set_share_intent(&self, root_id: &RecordId, shared: bool) -> RepoResult<()>;
}

pub struct SqliteGrantRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteGrantRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl GrantRepository for SqliteGrantRepository<'_> {
    fn get_grant(&self, root_id: &RecordId) -> RepoResult<Option<Grant>> {
        let header: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT state, updated_at FROM grants WHERE root_id = ?1;",
                [root_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((state_text, updated_at_ms)) = header else {
            return Ok(None);
        };
        let state = GrantState::parse(&state_text).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid grant state `{state_text}` in grants.state"))
        })?;

        let mut stmt = self.conn.prepare(
            "SELECT principal_id, role
             FROM grant_participants
             WHERE root_id = ?1
             ORDER BY principal_id ASC;",
        )?;
        let mut rows = stmt.query([root_id.as_str()])?;
        let mut participants = Vec::new();
        while let Some(row) = rows.next()? {
            let role_text: String = row.get(1)?;
            let role = ParticipantRole::parse(&role_text).ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "invalid role `{role_text}` in grant_participants.role"
                ))
            })?;
            participants.push(Participant::new(row.get::<_, String>(0)?, role));
        }

        Ok(Some(Grant {
            root_id: root_id.clone(),
            state,
            participants,
            updated_at_ms,
        }))
    }

    fn put_grant(&self, grant: &Grant) -> RepoResult<()> {
        grant.validate()?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO grants (root_id, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(root_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at;",
            params![
                grant.root_id.as_str(),
                grant.state.as_str(),
                grant.updated_at_ms
            ],
        )?;
        tx.execute(
            "DELETE FROM grant_participants WHERE root_id = ?1;",
            [grant.root_id.as_str()],
        )?;
        for participant in &grant.participants {
            tx.execute(
                "INSERT INTO grant_participants (root_id, principal_id, role)
                 VALUES (?1, ?2, ?3);",
                params![
                    grant.root_id.as_str(),
                    participant.principal_id.as_str(),
                    participant.role.as_str()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn set_grant_state(&self, root_id: &RecordId, state: GrantState) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE grants SET state = ?1, updated_at = ?2 WHERE root_id = ?3;",
            params![state.as_str(), now_epoch_ms(), root_id.as_str()],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(root_id.to_string()));
        }
        Ok(())
    }

    fn delete_grant(&self, root_id: &RecordId) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM grants WHERE root_id = ?1;", [root_id.as_str()])?;
        Ok(changed > 0)
    }

    fn share_intent(&self, root_id: &RecordId) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM share_intents WHERE root_id = ?1);",
            [root_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn set_share_intent(&self, root_id: &RecordId, shared: bool) -> RepoResult<()> {
        if shared {
            self.conn.execute(
                "INSERT INTO share_intents (root_id, created_at) VALUES (?1, ?2)
                 ON CONFLICT(root_id) DO NOTHING;",
                params![root_id.as_str(), now_epoch_ms()],
            )?;
        } else {
            self.conn.execute(
                "DELETE FROM share_intents WHERE root_id = ?1;",
                [root_id.as_str()],
            )?;
        }
        Ok(())
    }
}
