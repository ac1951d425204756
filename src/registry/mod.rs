//! # Registry Infrastructure
//!
//! The typed role registry and the pipeline definition that references it.
//!
//! ## Overview
//!
//! Roles are registered once, keyed by a stable [`AgentRoleId`]. The pipeline
//! definition names roles per task template, and the same role definition
//! drives task instantiation, invocation timeouts, retry ceilings and budget
//! reservations.
//!
//! ```text
//! Registry Infrastructure
//! ├── RoleRegistry        (roles, mandatory set, selection validation)
//! └── PipelineDefinition  (phases, task templates, gates)
//! ```

pub mod pipeline;
pub mod role_registry;

use thiserror::Error;

// Re-export main types for easy access
pub use pipeline::{GateDefinition, PhaseDefinition, PipelineDefinition, TaskTemplate};
pub use role_registry::{
    AgentRoleId, ExecutionMode, InvocationClass, RoleDefinition, RoleRegistry,
};

/// Errors raised by role and pipeline registration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Role already registered: {0}")]
    DuplicateRole(String),

    #[error("Invalid role selection (unknown: {unknown:?}, missing mandatory: {missing:?})")]
    InvalidSelection {
        unknown: Vec<String>,
        missing: Vec<String>,
    },

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),
}
