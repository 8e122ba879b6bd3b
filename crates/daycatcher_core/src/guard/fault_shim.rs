//! Boundary shim for reference faults.
//!
//! A dereference of an unfulfillable reference deep in the storage path
//! unwinds instead of returning an error. This shim is the only place that
//! catches such unwinds and turns them into an ordinary `FaultError`.

use log::warn;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};

const MAX_FAULT_MESSAGE_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultError {
    pub context: &'static str,
    pub message: String,
}

impl Display for FaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "reference fault during {}: {}", self.context, self.message)
    }
}

impl Error for FaultError {}

/// Runs `f`, converting an unwinding fault into `FaultError`.
pub fn guard_fault<T>(context: &'static str, f: impl FnOnce() -> T) -> Result<T, FaultError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string fault payload".to_string()
        };
        let message = message
            .replace(['\n', '\r'], " ")
            .chars()
            .take(MAX_FAULT_MESSAGE_CHARS)
            .collect::<String>();
        warn!("event=reference_fault module=guard status=error context={context}");
        FaultError { context, message }
    })
}

#[cfg(test)]
mod tests {
    use super::guard_fault;

    #[test]
    fn passes_values_through() {
        assert_eq!(guard_fault("noop", || 7), Ok(7));
    }

    #[test]
    fn converts_unwinds_into_errors() {
        let err = guard_fault("record_load", || -> u8 { panic!("object inaccessible") })
            .expect_err("fault must be caught");
        assert_eq!(err.context, "record_load");
        assert!(err.message.contains("inaccessible"));
    }
}
