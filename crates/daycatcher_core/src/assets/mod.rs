//! Asset payload synchronization.

pub mod engine;
pub mod transport;
