//! Accessibility guard and the reference-fault boundary shim.

pub mod accessibility;
pub mod fault_shim;
