//! # In-Memory Execution Store
//!
//! [`ExecutionStore`] backed by process memory behind a single
//! `parking_lot::RwLock`. Every trait call takes the lock once, so each call
//! is atomic with respect to every other call, the same guarantee the
//! PostgreSQL store gets from transactions.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::store::{
    CeilingUpdate, ExecutionRecords, ExecutionStore, GateResolveOutcome, StoreError,
    StoreResult,
};
use crate::models::{
    BudgetCeilings, BudgetDecision, BudgetScope, BudgetSnapshot, ChargeKey, ChargeOutcome, Cost,
    Execution, ExecutionTransition, Gate, NewExecutionTransition, NewTaskTransition,
    ScopeLedger, TaskRecord, TaskTransition,
};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    execution_uuid: Uuid,
    project_uuid: Uuid,
    amount: Cost,
}

#[derive(Debug, Default)]
struct MemoryState {
    executions: HashMap<Uuid, Execution>,
    execution_order: Vec<Uuid>,
    execution_transitions: HashMap<Uuid, Vec<ExecutionTransition>>,
    tasks: HashMap<Uuid, TaskRecord>,
    task_order: HashMap<Uuid, Vec<Uuid>>,
    task_transitions: HashMap<Uuid, Vec<TaskTransition>>,
    gates: HashMap<Uuid, Gate>,
    gate_order: HashMap<Uuid, Vec<Uuid>>,
    execution_ledgers: HashMap<Uuid, ScopeLedger>,
    project_ledgers: HashMap<Uuid, ScopeLedger>,
    reservations: HashMap<ChargeKey, Reservation>,
    committed: HashSet<ChargeKey>,
}

impl MemoryState {
    fn project_of(&self, execution_uuid: Uuid) -> StoreResult<Uuid> {
        self.executions
            .get(&execution_uuid)
            .map(|execution| execution.project_uuid)
            .ok_or_else(|| StoreError::not_found("execution", execution_uuid))
    }

    fn snapshot(&self, execution_uuid: Uuid) -> StoreResult<BudgetSnapshot> {
        let project_uuid = self.project_of(execution_uuid)?;
        let execution = self
            .execution_ledgers
            .get(&execution_uuid)
            .copied()
            .ok_or_else(|| StoreError::not_found("execution ledger", execution_uuid))?;
        let project = self
            .project_ledgers
            .get(&project_uuid)
            .copied()
            .ok_or_else(|| StoreError::not_found("project ledger", project_uuid))?;
        Ok(BudgetSnapshot {
            execution_uuid,
            project_uuid,
            execution,
            project,
        })
    }

    fn release(&mut self, key: ChargeKey) {
        if let Some(hold) = self.reservations.remove(&key) {
            if let Some(ledger) = self.execution_ledgers.get_mut(&hold.execution_uuid) {
                ledger.reserved = ledger.reserved.saturating_sub(hold.amount);
            }
            if let Some(ledger) = self.project_ledgers.get_mut(&hold.project_uuid) {
                ledger.reserved = ledger.reserved.saturating_sub(hold.amount);
            }
        }
    }

    fn debit(
        &mut self,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        self.release(key);
        if self.committed.contains(&key) {
            return Ok(ChargeOutcome::AlreadyCommitted);
        }

        let snapshot = self.snapshot(execution_uuid)?;
        for (scope, ledger) in [
            (BudgetScope::Execution, snapshot.execution),
            (BudgetScope::Project, snapshot.project),
        ] {
            if !ledger.can_debit(actual) {
                return Ok(ChargeOutcome::Rejected {
                    scope,
                    attempted: actual,
                    spent: ledger.spent,
                    ceiling: ledger.ceiling,
                });
            }
        }

        let execution_spent = match self.execution_ledgers.get_mut(&execution_uuid) {
            Some(ledger) => {
                ledger.spent = ledger.spent.saturating_add(actual);
                ledger.spent
            }
            None => return Err(StoreError::not_found("execution ledger", execution_uuid)),
        };
        let project_spent = match self.project_ledgers.get_mut(&snapshot.project_uuid) {
            Some(ledger) => {
                ledger.spent = ledger.spent.saturating_add(actual);
                ledger.spent
            }
            None => return Err(StoreError::not_found("project ledger", snapshot.project_uuid)),
        };
        self.committed.insert(key);

        Ok(ChargeOutcome::Committed {
            execution_spent,
            project_spent,
        })
    }

    fn tasks_of(&self, execution_uuid: Uuid) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .task_order
            .get(&execution_uuid)
            .map(|order| {
                order
                    .iter()
                    .filter_map(|uuid| self.tasks.get(uuid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by_key(|task| task.phase);
        tasks
    }

    fn gates_of(&self, execution_uuid: Uuid) -> Vec<Gate> {
        let mut gates: Vec<Gate> = self
            .gate_order
            .get(&execution_uuid)
            .map(|order| {
                order
                    .iter()
                    .filter_map(|uuid| self.gates.get(uuid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        gates.sort_by_key(|gate| (gate.phase, gate.round));
        gates
    }

    fn check_task_transition(&self, transition: &NewTaskTransition) -> StoreResult<()> {
        let stored = self
            .tasks
            .get(&transition.task_uuid)
            .ok_or_else(|| StoreError::not_found("task", transition.task_uuid))?;
        let stored_state = stored.status.to_string();
        if transition.from_state.as_deref() != Some(stored_state.as_str()) {
            return Err(StoreError::Conflict(format!(
                "task {} is {stored_state}, transition expected {:?}",
                transition.task_uuid, transition.from_state
            )));
        }
        Ok(())
    }

    fn write_task(&mut self, task: &TaskRecord, transition: NewTaskTransition) {
        let history = self.task_transitions.entry(task.task_uuid).or_default();
        let sort_key = history.len() as i32 + 1;
        history.push(transition.into_transition(sort_key));
        self.tasks.insert(task.task_uuid, task.clone());
    }
}

/// Thread-safe in-memory store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(
        &self,
        execution: &Execution,
        ceilings: &BudgetCeilings,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.executions.contains_key(&execution.execution_uuid) {
            return Err(StoreError::Duplicate(format!(
                "execution {}",
                execution.execution_uuid
            )));
        }

        state.executions.insert(execution.execution_uuid, execution.clone());
        state.execution_order.push(execution.execution_uuid);
        state.execution_ledgers.insert(
            execution.execution_uuid,
            ScopeLedger {
                ceiling: ceilings.execution,
                ..ScopeLedger::default()
            },
        );
        state
            .project_ledgers
            .entry(execution.project_uuid)
            .or_insert_with(|| ScopeLedger {
                ceiling: ceilings.project,
                ..ScopeLedger::default()
            });

        let initial = NewExecutionTransition {
            execution_uuid: execution.execution_uuid,
            from_state: None,
            to_state: execution.state.to_string(),
            event: "create".to_string(),
            metadata: json!({ "selected_roles": execution.selected_roles }),
        };
        state
            .execution_transitions
            .insert(execution.execution_uuid, vec![initial.into_transition(1)]);
        Ok(())
    }

    async fn get_execution(&self, execution_uuid: Uuid) -> StoreResult<Execution> {
        self.state
            .read()
            .executions
            .get(&execution_uuid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution", execution_uuid))
    }

    async fn load_records(&self, execution_uuid: Uuid) -> StoreResult<ExecutionRecords> {
        let state = self.state.read();
        let execution = state
            .executions
            .get(&execution_uuid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution", execution_uuid))?;
        Ok(ExecutionRecords {
            execution,
            tasks: state.tasks_of(execution_uuid),
            gates: state.gates_of(execution_uuid),
        })
    }

    async fn save_execution(
        &self,
        execution: &Execution,
        transition: Option<NewExecutionTransition>,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        let stored = state
            .executions
            .get(&execution.execution_uuid)
            .ok_or_else(|| StoreError::not_found("execution", execution.execution_uuid))?;

        match &transition {
            Some(transition) => {
                let stored_state = stored.state.to_string();
                if transition.from_state.as_deref() != Some(stored_state.as_str()) {
                    return Err(StoreError::Conflict(format!(
                        "execution {} is {stored_state}, transition expected {:?}",
                        execution.execution_uuid, transition.from_state
                    )));
                }
            }
            None if stored.state != execution.state => {
                return Err(StoreError::Conflict(format!(
                    "execution {} state changed without a transition",
                    execution.execution_uuid
                )));
            }
            None => {}
        }

        if let Some(transition) = transition {
            let history = state
                .execution_transitions
                .entry(execution.execution_uuid)
                .or_default();
            let sort_key = history.len() as i32 + 1;
            history.push(transition.into_transition(sort_key));
        }
        state
            .executions
            .insert(execution.execution_uuid, execution.clone());
        Ok(())
    }

    async fn list_unfinished_executions(&self) -> StoreResult<Vec<Execution>> {
        let state = self.state.read();
        Ok(state
            .execution_order
            .iter()
            .filter_map(|uuid| state.executions.get(uuid))
            .filter(|execution| !execution.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_execution_transitions(
        &self,
        execution_uuid: Uuid,
    ) -> StoreResult<Vec<ExecutionTransition>> {
        let state = self.state.read();
        if !state.executions.contains_key(&execution_uuid) {
            return Err(StoreError::not_found("execution", execution_uuid));
        }
        Ok(state
            .execution_transitions
            .get(&execution_uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_tasks(&self, tasks: &[TaskRecord]) -> StoreResult<()> {
        let mut state = self.state.write();
        if let Some(existing) = tasks
            .iter()
            .find(|task| state.tasks.contains_key(&task.task_uuid))
        {
            return Err(StoreError::Duplicate(format!("task {}", existing.task_uuid)));
        }

        for task in tasks {
            state
                .task_order
                .entry(task.execution_uuid)
                .or_default()
                .push(task.task_uuid);
            let initial = NewTaskTransition {
                task_uuid: task.task_uuid,
                execution_uuid: task.execution_uuid,
                from_state: None,
                to_state: task.status.to_string(),
                event: "create".to_string(),
                metadata: json!({ "phase": task.phase + 1, "role": task.role }),
            };
            state
                .task_transitions
                .insert(task.task_uuid, vec![initial.into_transition(1)]);
            state.tasks.insert(task.task_uuid, task.clone());
        }
        Ok(())
    }

    async fn list_tasks(&self, execution_uuid: Uuid) -> StoreResult<Vec<TaskRecord>> {
        Ok(self.state.read().tasks_of(execution_uuid))
    }

    async fn get_task(&self, task_uuid: Uuid) -> StoreResult<TaskRecord> {
        self.state
            .read()
            .tasks
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_uuid))
    }

    async fn save_task(
        &self,
        task: &TaskRecord,
        transition: NewTaskTransition,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        state.check_task_transition(&transition)?;
        state.write_task(task, transition);
        Ok(())
    }

    async fn record_task_message(
        &self,
        task_uuid: Uuid,
        invocation_uuid: Uuid,
        message: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&task_uuid)
            .ok_or_else(|| StoreError::not_found("task", task_uuid))?;
        if task.invocation_uuid == Some(invocation_uuid) {
            task.last_message = Some(message.to_string());
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_task_transitions(&self, task_uuid: Uuid) -> StoreResult<Vec<TaskTransition>> {
        let state = self.state.read();
        state
            .task_transitions
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_uuid))
    }

    async fn insert_gate(&self, gate: &Gate) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.gates.contains_key(&gate.gate_uuid) {
            return Err(StoreError::Duplicate(format!("gate {}", gate.gate_uuid)));
        }
        state
            .gate_order
            .entry(gate.execution_uuid)
            .or_default()
            .push(gate.gate_uuid);
        state.gates.insert(gate.gate_uuid, gate.clone());
        Ok(())
    }

    async fn get_gate(&self, gate_uuid: Uuid) -> StoreResult<Gate> {
        self.state
            .read()
            .gates
            .get(&gate_uuid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("gate", gate_uuid))
    }

    async fn list_gates(&self, execution_uuid: Uuid) -> StoreResult<Vec<Gate>> {
        Ok(self.state.read().gates_of(execution_uuid))
    }

    async fn resolve_gate(&self, gate: &Gate) -> StoreResult<GateResolveOutcome> {
        let mut state = self.state.write();
        let stored = state
            .gates
            .get_mut(&gate.gate_uuid)
            .ok_or_else(|| StoreError::not_found("gate", gate.gate_uuid))?;

        if !stored.is_pending() {
            return Ok(GateResolveOutcome::AlreadyResolved(stored.clone()));
        }
        *stored = gate.clone();
        Ok(GateResolveOutcome::Resolved(stored.clone()))
    }

    async fn budget_snapshot(&self, execution_uuid: Uuid) -> StoreResult<BudgetSnapshot> {
        self.state.read().snapshot(execution_uuid)
    }

    async fn update_ceilings(
        &self,
        execution_uuid: Uuid,
        update: CeilingUpdate,
    ) -> StoreResult<BudgetSnapshot> {
        let mut state = self.state.write();
        let snapshot = state.snapshot(execution_uuid)?;

        for (scope, ledger, ceiling) in [
            (BudgetScope::Execution, snapshot.execution, update.execution),
            (BudgetScope::Project, snapshot.project, update.project),
        ] {
            if let Some(ceiling) = ceiling {
                if ceiling < ledger.spent {
                    return Err(StoreError::Conflict(format!(
                        "{scope} ceiling {ceiling} is below current spend {}",
                        ledger.spent
                    )));
                }
            }
        }

        if let (Some(ceiling), Some(ledger)) = (
            update.execution,
            state.execution_ledgers.get_mut(&execution_uuid),
        ) {
            ledger.ceiling = ceiling;
        }
        if let (Some(ceiling), Some(ledger)) = (
            update.project,
            state.project_ledgers.get_mut(&snapshot.project_uuid),
        ) {
            ledger.ceiling = ceiling;
        }
        state.snapshot(execution_uuid)
    }

    async fn reserve_budget(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        estimate: Cost,
    ) -> StoreResult<BudgetDecision> {
        let mut state = self.state.write();
        if state.reservations.contains_key(&key) || state.committed.contains(&key) {
            return Ok(BudgetDecision::Admitted);
        }

        let snapshot = state.snapshot(execution_uuid)?;
        for (scope, ledger) in [
            (BudgetScope::Execution, snapshot.execution),
            (BudgetScope::Project, snapshot.project),
        ] {
            if !ledger.can_reserve(estimate) {
                return Ok(BudgetDecision::Rejected {
                    scope,
                    requested: estimate,
                    spent: ledger.spent,
                    reserved: ledger.reserved,
                    ceiling: ledger.ceiling,
                });
            }
        }

        if let Some(ledger) = state.execution_ledgers.get_mut(&execution_uuid) {
            ledger.reserved = ledger.reserved.saturating_add(estimate);
        }
        if let Some(ledger) = state.project_ledgers.get_mut(&snapshot.project_uuid) {
            ledger.reserved = ledger.reserved.saturating_add(estimate);
        }
        state.reservations.insert(
            key,
            Reservation {
                execution_uuid,
                project_uuid: snapshot.project_uuid,
                amount: estimate,
            },
        );
        Ok(BudgetDecision::Admitted)
    }

    async fn release_reservation(&self, _execution_uuid: Uuid, key: ChargeKey) -> StoreResult<()> {
        self.state.write().release(key);
        Ok(())
    }

    async fn release_all_reservations(&self, execution_uuid: Uuid) -> StoreResult<Cost> {
        let mut state = self.state.write();
        let keys: Vec<ChargeKey> = state
            .reservations
            .iter()
            .filter(|(_, hold)| hold.execution_uuid == execution_uuid)
            .map(|(key, _)| *key)
            .collect();
        let released = keys
            .iter()
            .filter_map(|key| state.reservations.get(key).map(|hold| hold.amount))
            .sum();
        for key in keys {
            state.release(key);
        }
        Ok(released)
    }

    async fn commit_charge(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        self.state.write().debit(execution_uuid, key, actual)
    }

    async fn complete_task_with_charge(
        &self,
        task: &TaskRecord,
        transition: NewTaskTransition,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        let mut state = self.state.write();
        state.check_task_transition(&transition)?;

        let outcome = state.debit(task.execution_uuid, key, actual)?;
        if outcome.is_accepted() {
            state.write_task(task, transition);
        }
        Ok(outcome)
    }
}
