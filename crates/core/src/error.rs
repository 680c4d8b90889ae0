//! Error taxonomy for sweep construction and job submission.
//!
//! Validation errors are raised synchronously, before any unit of work is
//! dispatched. Unit-level failures never appear here: they are absorbed into
//! null-metric results by the orchestrator.

use crate::job::JobId;
use thiserror::Error;

/// Errors raised while building or submitting a sweep.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A parameter range violates `step > 0` or `stop >= start`.
    #[error("invalid range for `{name}`: {reason}")]
    InvalidRange { name: String, reason: String },

    /// A sweep needs at least one parameter.
    #[error("parameter grid is empty: at least one parameter range is required")]
    EmptyGrid,

    /// Cartesian product exceeds the configured ceiling.
    #[error("grid expands to {total} variants, above the limit of {limit}")]
    GridTooLarge { total: u128, limit: usize },

    /// Constraint expression failed to parse or type-check.
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Walk-forward window months must all be positive.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Data span too short for a single train/test window.
    #[error("insufficient history for requested windows: {0}")]
    InsufficientHistory(String),

    /// Unknown objective name.
    #[error("invalid objective `{0}`: expected one of final, sharpe, pf")]
    InvalidObjective(String),

    /// Any other malformed request field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No job with this id is known to the registry or the store.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// Result store rejected a read or write.
    #[error("result store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Stable machine-readable code for the error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRange { .. } => "invalid_range",
            Self::EmptyGrid => "empty_grid",
            Self::GridTooLarge { .. } => "grid_too_large",
            Self::InvalidConstraint(_) => "invalid_constraint",
            Self::InvalidWindow(_) => "invalid_window",
            Self::InsufficientHistory(_) => "insufficient_history",
            Self::InvalidObjective(_) => "invalid_objective",
            Self::InvalidRequest(_) => "invalid_request",
            Self::JobNotFound(_) => "job_not_found",
            Self::Store(_) => "store_unavailable",
        }
    }

    /// True for errors that reject a request before a job exists.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        !matches!(self, Self::JobNotFound(_) | Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::EmptyGrid.code(), "empty_grid");
        assert_eq!(
            EngineError::InvalidConstraint("x".to_string()).code(),
            "invalid_constraint"
        );
        assert_eq!(EngineError::Store("down".to_string()).code(), "store_unavailable");
    }

    #[test]
    fn validation_errors_are_flagged() {
        assert!(EngineError::EmptyGrid.is_validation());
        assert!(EngineError::InsufficientHistory("short".to_string()).is_validation());
        assert!(!EngineError::Store("down".to_string()).is_validation());
        assert!(!EngineError::JobNotFound(uuid::Uuid::nil()).is_validation());
    }

    #[test]
    fn messages_name_the_parameter() {
        let err = EngineError::InvalidRange {
            name: "fast".to_string(),
            reason: "step must be > 0".to_string(),
        };
        assert_eq!(err.to_string(), "invalid range for `fast`: step must be > 0");
    }
}
