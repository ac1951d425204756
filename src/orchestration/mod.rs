//! # Orchestration Engine
//!
//! Drives agent-pipeline executions from start to a terminal state.
//!
//! ## Architecture
//!
//! Each live execution is owned by one [`ExecutionRunner`], an actor that is
//! the single writer of the execution's records. Agent invocations run
//! concurrently inside the runner's task set and report back by message, so
//! concurrent completions never race on execution-level fields. The
//! [`Orchestrator`] facade validates requests and routes them to runners;
//! queries read the store directly.
//!
//! ## Core Components
//!
//! - **TaskGraph**: dependency analysis of one phase's tasks (ready set,
//!   unreachable tasks, completion)
//! - **TaskInitializer**: instantiates a phase's tasks from the pipeline
//!   templates and the execution's role selection
//! - **AgentGateway**: uniform invocation of registered workers with
//!   timeouts, cancellation and failure classification
//! - **ErrorClassifier**: maps worker errors to transient or permanent
//! - **BackoffCalculator**: retry delays with exponential growth and jitter
//! - **BudgetGuard**: reservations and debits against execution and project
//!   spend ceilings
//! - **GateManager**: review rounds at phase boundaries
//! - **ProgressAggregator**: consistent read-only progress snapshots

pub mod backoff_calculator;
pub mod budget_guard;
pub mod error_classifier;
pub mod errors;
pub mod execution_runner;
pub mod gate_manager;
pub mod gateway;
pub mod orchestrator;
pub mod progress;
pub mod task_graph;
pub mod task_initializer;
pub mod types;

pub use backoff_calculator::{
    BackoffCalculator, BackoffCalculatorConfig, BackoffResult, BackoffType,
};
pub use budget_guard::BudgetGuard;
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorContext, StandardErrorClassifier,
};
pub use errors::{OrchestrationError, OrchestrationResult};
pub use execution_runner::{ExecutionRunner, ExecutionRunnerHandle, RunnerCommand, RunnerContext};
pub use gate_manager::{GateManager, GateResolutionRequest};
pub use gateway::{
    AgentError, AgentGateway, AgentOutput, AgentRequest, AgentWorker, BuildStage,
    InvocationContext, InvocationOutcome, StageReporter, StageUpdate, StageUpdateKind,
};
pub use orchestrator::Orchestrator;
pub use progress::{
    ExecutionStatus, PendingGate, ProgressAggregator, ProgressSnapshot, TaskProgress,
};
pub use task_graph::{PhaseCompletion, TaskGraph, UnreachableTask};
pub use task_initializer::TaskInitializer;
pub use types::{GateResolutionResponse, StartExecutionRequest};
