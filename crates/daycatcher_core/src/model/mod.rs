//! Domain model for records, media assets, partitions and grants.
//!
//! # Responsibility
//! - Define the canonical shapes shared by repositories and sync services.
//! - Keep derived sync dispositions as pure functions over stored fields.
//!
//! # Invariants
//! - Every record has exactly one home partition for its whole lifetime.
//! - Asset dispositions are computed, never persisted.

pub mod asset;
pub mod grant;
pub mod partition;
pub mod record;
