//! Record store adapter: typed CRUD over one partition store.
//!
//! # Responsibility
//! - Keep SQL inside the persistence boundary.
//! - Return semantic errors (`NotFound`, `PartitionMismatch`) alongside
//!   transport errors.
//!
//! # Invariants
//! - Write paths validate models before touching SQL.
//! - Read paths reject invalid persisted state instead of masking it.

pub mod asset_repo;
pub mod grant_repo;
pub mod record_repo;

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
