//! # Orchestration Errors
//!
//! Errors returned by the orchestrator's public operations. Store and state
//! machine failures are wrapped; the remaining variants are caller errors
//! with enough context to explain what was rejected.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::database::StoreError;
use crate::models::GateResolution;
use crate::registry::RegistryError;
use crate::state_machine::StateMachineError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("Invalid agent selection: {reason}")]
    InvalidSelection { reason: String },

    #[error("Execution {execution_uuid} is not waiting on a gate (state: {state})")]
    GateNotPending { execution_uuid: Uuid, state: String },

    #[error("Gate {gate_uuid} was already resolved as {resolution}")]
    GateAlreadyResolved {
        gate_uuid: Uuid,
        resolution: GateResolution,
    },

    #[error("Execution {execution_uuid} cannot be retried from state {state}")]
    NotRetryable { execution_uuid: Uuid, state: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Execution {execution_uuid} is already {state}")]
    ExecutionTerminal { execution_uuid: Uuid, state: String },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Operator override rejected: {reason}")]
    InvalidOverride { reason: String },

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Execution runner for {0} is not available")]
    RunnerUnavailable(Uuid),

    #[error("Timed out after {waited_ms}ms waiting for execution {execution_uuid}")]
    WaitTimeout { execution_uuid: Uuid, waited_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl From<RegistryError> for OrchestrationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidPipeline(reason) => Self::InvalidPipeline(reason),
            other => Self::InvalidSelection {
                reason: other.to_string(),
            },
        }
    }
}

impl OrchestrationError {
    /// Map a store `NotFound` onto the matching orchestration variant
    pub fn from_lookup(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: "execution",
                id,
            } => Self::ExecutionNotFound(id),
            StoreError::NotFound { entity: "task", id } => Self::TaskNotFound(id),
            other => Self::Store(other),
        }
    }

    /// Whether the error comes from the caller rather than the system
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::Store(_)
                | Self::StateMachine(_)
                | Self::RunnerUnavailable(_)
                | Self::Configuration(_)
        )
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
