//! Remote partition manager.
//!
//! Owns the owned/received partition stores and the readiness gate for each.

pub mod manager;
pub mod store;
