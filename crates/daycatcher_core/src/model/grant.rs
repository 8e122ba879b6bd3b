//! Sharing grant model.
//!
//! # Responsibility
//! - Describe who can see an aggregate root and with which role.
//! - Encode the grant lifecycle `pending_invite -> active -> revoked`.
//!
//! # Invariants
//! - A grant has exactly one owner participant.
//! - A principal appears at most once per grant.
//! - `revoked` is terminal for one grant instance.

use crate::model::record::RecordId;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Stable identity of a participating user.
pub type PrincipalId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    ReadWrite,
    ReadOnly,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::ReadWrite => "read_write",
            Self::ReadOnly => "read_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "read_write" => Some(Self::ReadWrite),
            "read_only" => Some(Self::ReadOnly),
            _ => None,
        }
    }

    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub principal_id: PrincipalId,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn new(principal_id: impl Into<PrincipalId>, role: ParticipantRole) -> Self {
        Self {
            principal_id: principal_id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    PendingInvite,
    Active,
    Revoked,
}

impl GrantState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingInvite => "pending_invite",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_invite" => Some(Self::PendingInvite),
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: GrantState) -> bool {
        matches!(
            (self, next),
            (Self::PendingInvite, Self::Active)
                | (Self::PendingInvite, Self::Revoked)
                | (Self::Active, Self::Revoked)
        )
    }
}

/// Sharing relationship rooted at one aggregate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub root_id: RecordId,
    pub state: GrantState,
    pub participants: Vec<Participant>,
    /// Unix epoch milliseconds.
    pub updated_at_ms: i64,
}

impl Grant {
    pub fn is_revoked(&self) -> bool {
        self.state == GrantState::Revoked
    }

    pub fn role_of(&self, principal_id: &str) -> Option<ParticipantRole> {
        self.participants
            .iter()
            .find(|participant| participant.principal_id == principal_id)
            .map(|participant| participant.role)
    }

    pub fn owner(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.role == ParticipantRole::Owner)
    }

    pub fn validate(&self) -> Result<(), GrantValidationError> {
        let owners = self
            .participants
            .iter()
            .filter(|participant| participant.role == ParticipantRole::Owner)
            .count();
        if owners != 1 {
            return Err(GrantValidationError::OwnerCount(owners));
        }

        let mut seen = std::collections::BTreeSet::new();
        for participant in &self.participants {
            if participant.principal_id.trim().is_empty() {
                return Err(GrantValidationError::EmptyPrincipal);
            }
            if !seen.insert(participant.principal_id.as_str()) {
                return Err(GrantValidationError::DuplicatePrincipal(
                    participant.principal_id.clone(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantValidationError {
    OwnerCount(usize),
    EmptyPrincipal,
    DuplicatePrincipal(PrincipalId),
}

impl Display for GrantValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OwnerCount(count) => {
                write!(f, "grant must have exactly one owner, found {count}")
            }
            Self::EmptyPrincipal => write!(f, "grant participant id must not be empty"),
            Self::DuplicatePrincipal(id) => write!(f, "grant lists participant twice: {id}"),
        }
    }
}

impl Error for GrantValidationError {}
