//! Error types for the conductor orchestrator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConductorError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Agent error: {0}")]
    AgentError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ConductorError {
    fn from(error: serde_json::Error) -> Self {
        ConductorError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for ConductorError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        ConductorError::ConfigurationError(error.to_string())
    }
}

impl From<crate::database::StoreError> for ConductorError {
    fn from(error: crate::database::StoreError) -> Self {
        ConductorError::DatabaseError(error.to_string())
    }
}

impl From<crate::state_machine::StateMachineError> for ConductorError {
    fn from(error: crate::state_machine::StateMachineError) -> Self {
        ConductorError::StateTransitionError(error.to_string())
    }
}

impl From<crate::orchestration::OrchestrationError> for ConductorError {
    fn from(error: crate::orchestration::OrchestrationError) -> Self {
        ConductorError::OrchestrationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
