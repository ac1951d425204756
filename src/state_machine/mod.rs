//! # State Machines
//!
//! Execution and task lifecycles as explicit transition tables. Each machine
//! computes the target state for an event, checks guards, applies record
//! actions and persists the record together with an audit transition row.

pub mod actions;
pub mod errors;
pub mod events;
pub mod execution_state_machine;
pub mod guards;
pub mod states;
pub mod task_state_machine;

// Re-export main types for convenient access
pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::{ExecutionEvent, TaskEvent};
pub use execution_state_machine::ExecutionStateMachine;
pub use states::{ExecutionState, TaskStatus};
pub use task_state_machine::TaskStateMachine;

// Common traits and utilities
pub use actions::StateAction;
pub use guards::{DependencyStatuses, StateGuard};
