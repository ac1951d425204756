use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    BudgetCeilings, BudgetDecision, BudgetSnapshot, ChargeKey, ChargeOutcome, Cost, Execution,
    ExecutionTransition, Gate, NewExecutionTransition, NewTaskTransition, TaskRecord,
    TaskTransition,
};

/// Storage errors surfaced to the state machines and orchestrator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// Optimistic check failed: the persisted record moved on
    #[error("Concurrent modification conflict: {0}")]
    Conflict(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a compare-and-set gate resolution
#[derive(Debug, Clone, PartialEq)]
pub enum GateResolveOutcome {
    /// This call moved the gate out of `pending`
    Resolved(Gate),
    /// Someone else resolved it first; carries the stored gate
    AlreadyResolved(Gate),
}

/// Execution, tasks and gates read at one consistent point in time
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecords {
    pub execution: Execution,
    pub tasks: Vec<TaskRecord>,
    pub gates: Vec<Gate>,
}

/// Partial ceiling update; `None` leaves the scope unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CeilingUpdate {
    pub execution: Option<Cost>,
    pub project: Option<Cost>,
}

/// Durable storage for execution, task, gate and ledger records
///
/// Writes that carry a transition are compare-and-set: they fail with
/// [`StoreError::Conflict`] when the stored state differs from the
/// transition's `from_state`. Ledger operations are atomic per call.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert a new execution, its ledger rows and its initial transition
    ///
    /// An existing project ledger keeps its ceiling and spend.
    async fn create_execution(
        &self,
        execution: &Execution,
        ceilings: &BudgetCeilings,
    ) -> StoreResult<()>;

    async fn get_execution(&self, execution_uuid: Uuid) -> StoreResult<Execution>;

    /// Read an execution with all of its tasks and gates as one snapshot
    async fn load_records(&self, execution_uuid: Uuid) -> StoreResult<ExecutionRecords>;

    async fn save_execution(
        &self,
        execution: &Execution,
        transition: Option<NewExecutionTransition>,
    ) -> StoreResult<()>;

    /// Executions not yet in a terminal state, oldest first
    async fn list_unfinished_executions(&self) -> StoreResult<Vec<Execution>>;

    async fn list_execution_transitions(
        &self,
        execution_uuid: Uuid,
    ) -> StoreResult<Vec<ExecutionTransition>>;

    /// Insert freshly instantiated tasks, each with an initial transition
    async fn insert_tasks(&self, tasks: &[TaskRecord]) -> StoreResult<()>;

    /// All tasks of an execution ordered by phase then creation
    async fn list_tasks(&self, execution_uuid: Uuid) -> StoreResult<Vec<TaskRecord>>;

    async fn get_task(&self, task_uuid: Uuid) -> StoreResult<TaskRecord>;

    async fn save_task(&self, task: &TaskRecord, transition: NewTaskTransition)
        -> StoreResult<()>;

    /// Record a worker progress message without changing status.
    ///
    /// Ignored when `invocation_uuid` is no longer the task's current invocation.
    async fn record_task_message(
        &self,
        task_uuid: Uuid,
        invocation_uuid: Uuid,
        message: &str,
    ) -> StoreResult<()>;

    async fn list_task_transitions(&self, task_uuid: Uuid) -> StoreResult<Vec<TaskTransition>>;

    async fn insert_gate(&self, gate: &Gate) -> StoreResult<()>;

    async fn get_gate(&self, gate_uuid: Uuid) -> StoreResult<Gate>;

    /// All gates of an execution ordered by phase then round
    async fn list_gates(&self, execution_uuid: Uuid) -> StoreResult<Vec<Gate>>;

    /// Persist a resolution only if the stored gate is still pending
    async fn resolve_gate(&self, gate: &Gate) -> StoreResult<GateResolveOutcome>;

    async fn budget_snapshot(&self, execution_uuid: Uuid) -> StoreResult<BudgetSnapshot>;

    /// Change ceilings; a ceiling below current spend is a conflict
    async fn update_ceilings(
        &self,
        execution_uuid: Uuid,
        update: CeilingUpdate,
    ) -> StoreResult<BudgetSnapshot>;

    /// Hold `estimate` against both scopes if spend plus holds stays under the ceilings
    async fn reserve_budget(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        estimate: Cost,
    ) -> StoreResult<BudgetDecision>;

    /// Drop the hold for `key`; a missing hold is not an error
    async fn release_reservation(&self, execution_uuid: Uuid, key: ChargeKey) -> StoreResult<()>;

    /// Debit `actual` against both scopes, idempotent per `key`
    /// Drop every outstanding hold of an execution, returning the total released
    async fn release_all_reservations(&self, execution_uuid: Uuid) -> StoreResult<Cost>;

    async fn commit_charge(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome>;

    /// Debit the charge and persist the completed task in one atomic step
    ///
    /// A rejected debit leaves the task untouched and releases the hold.
    async fn complete_task_with_charge(
        &self,
        task: &TaskRecord,
        transition: NewTaskTransition,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome>;
}
