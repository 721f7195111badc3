//! Error taxonomy for the mirror engine.
//!
//! Four classes with distinct handling:
//! - `Transient`: retried with bounded backoff; a trader whose fetch
//!   exhausts retries is skipped for the current cycle only.
//! - `DataInvalid`: the trader is excluded from scoring for this cycle.
//! - `InvariantViolation`: a programming defect; the cycle aborts without
//!   submitting any order.
//! - `ExecutionFailure`: logged, position left untouched, picked up again
//!   by the next cycle's diff.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Provider rate limit, network timeout, or similar recoverable failure.
    #[error("transient failure in {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// Malformed or missing required metric for a trader.
    #[error("invalid data for trader {address}: {reason}")]
    DataInvalid { address: String, reason: String },

    /// A computed target breached a cap after the risk overlay ran.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Order rejected by the execution venue.
    #[error("execution failure for order {order_id}: {reason}")]
    ExecutionFailure { order_id: String, reason: String },
}

impl EngineError {
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn data_invalid(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataInvalid {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
