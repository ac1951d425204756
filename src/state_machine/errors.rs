use thiserror::Error;

use crate::database::StoreError;

/// Comprehensive error types for state machine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },

    #[error("Persistence operation failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Dependencies not satisfied: {reason}")]
    DependenciesNotMet { reason: String },

    #[error("Retry attempts exhausted: {attempts} of {max_attempts}")]
    AttemptsExhausted { attempts: u32, max_attempts: u32 },

    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        Self::GuardFailed {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

/// Helper function to create guard dependency errors
pub fn dependencies_not_met(reason: impl Into<String>) -> GuardError {
    GuardError::DependenciesNotMet {
        reason: reason.into(),
    }
}

/// Helper function to create business rule violations
pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}
