//! # Models
//!
//! Value objects for everything the orchestrator persists. Every state the
//! orchestrator acts on is reconstructed from these records, so nothing here
//! carries live handles or in-memory-only data.

pub mod budget;
pub mod execution;
pub mod gate;
pub mod task;
pub mod transition;

pub use budget::{
    BudgetCeilings, BudgetDecision, BudgetScope, BudgetSnapshot, ChargeKey, ChargeOutcome, Cost,
    ScopeLedger,
};
pub use execution::{Execution, ExecutionOutcome, FailureReason};
pub use gate::{Gate, GateDecision, GateDecisionInput, GateGap, GateResolution};
pub use task::TaskRecord;
pub use transition::{
    ExecutionTransition, NewExecutionTransition, NewTaskTransition, TaskTransition,
};
