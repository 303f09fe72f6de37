//! Error taxonomy for the optimization and pairs engines.
//!
//! The split matters for control flow: `Configuration` and
//! `ContractViolation` abort a whole run, `InsufficientData` only excludes
//! the candidate or pair that raised it, and `Cancelled` is a normal
//! terminal transition rather than a failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed parameter space, invalid algorithm name, bad thresholds.
    /// Fatal: the run never starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Not enough price history for one candidate or one pair. Recoverable:
    /// that unit is excluded or penalized, processing continues.
    #[error("insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Programming error in the search loop (batch-size mismatch,
    /// out-of-bounds candidate). Always fatal, never swallowed.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Cooperative cancellation was honored. Not a failure.
    #[error("run cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error should abort an entire run/batch (as opposed to
    /// excluding a single candidate or pair).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_)
                | EngineError::ContractViolation(_)
                | EngineError::Storage(_)
                | EngineError::Serialization(_)
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_split() {
        assert!(EngineError::Configuration("bad space".into()).is_fatal());
        assert!(EngineError::ContractViolation("batch mismatch".into()).is_fatal());
        assert!(!EngineError::InsufficientData {
            required: 20,
            actual: 3
        }
        .is_fatal());
        assert!(!EngineError::Cancelled.is_fatal());
    }
}
