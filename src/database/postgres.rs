//! # PostgreSQL Execution Store
//!
//! [`ExecutionStore`] on PostgreSQL via `sqlx` runtime queries. Compare-and-set
//! writes lock the target row with `SELECT ... FOR UPDATE` inside a
//! transaction. Ledger operations always lock the project ledger before the
//! execution ledger, so concurrent debits from sibling executions serialize
//! without deadlocking.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgConnection, PgPool, Row};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use super::store::{
    CeilingUpdate, ExecutionRecords, ExecutionStore, GateResolveOutcome, StoreError,
    StoreResult,
};
use crate::models::{
    BudgetCeilings, BudgetDecision, BudgetScope, BudgetSnapshot, ChargeKey, ChargeOutcome, Cost,
    Execution, ExecutionOutcome, ExecutionTransition, FailureReason, Gate, GateDecisionInput,
    GateResolution, NewExecutionTransition, NewTaskTransition, ScopeLedger, TaskRecord,
    TaskTransition,
};
use crate::registry::AgentRoleId;
use crate::state_machine::{ExecutionState, TaskStatus};

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

fn to_micros(cost: Cost) -> i64 {
    i64::try_from(cost.micros()).unwrap_or(i64::MAX)
}

fn from_micros(value: i64) -> Cost {
    Cost::from_micros(u64::try_from(value).unwrap_or(0))
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    raw.parse().map_err(StoreError::Serialization)
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_usize(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn execution_from_row(row: &PgRow) -> StoreResult<Execution> {
    let state: String = row.try_get("state")?;
    let outcome: String = row.try_get("outcome")?;
    let selected_roles: Value = row.try_get("selected_roles")?;
    let failure: Option<Value> = row.try_get("failure")?;

    Ok(Execution {
        execution_uuid: row.try_get("execution_uuid")?,
        project_uuid: row.try_get("project_uuid")?,
        state: parse::<ExecutionState>(&state)?,
        current_phase: to_usize(row.try_get("current_phase")?),
        selected_roles: serde_json::from_value::<Vec<AgentRoleId>>(selected_roles)?,
        paused: row.try_get("paused")?,
        progress: row.try_get("progress")?,
        outcome: parse::<ExecutionOutcome>(&outcome)?,
        failure: failure
            .map(serde_json::from_value::<FailureReason>)
            .transpose()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> StoreResult<TaskRecord> {
    let status: String = row.try_get("status")?;
    let role: String = row.try_get("role")?;
    let dependencies: Value = row.try_get("dependencies")?;

    Ok(TaskRecord {
        task_uuid: row.try_get("task_uuid")?,
        execution_uuid: row.try_get("execution_uuid")?,
        phase: to_usize(row.try_get("phase")?),
        task_key: row.try_get("task_key")?,
        role: AgentRoleId::from(role),
        dependencies: serde_json::from_value(dependencies)?,
        optional: row.try_get("optional")?,
        status: parse::<TaskStatus>(&status)?,
        attempts: to_u32(row.try_get("attempts")?),
        max_attempts: to_u32(row.try_get("max_attempts")?),
        last_error: row.try_get("last_error")?,
        last_message: row.try_get("last_message")?,
        invocation_uuid: row.try_get("invocation_uuid")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        artifact: row.try_get("artifact")?,
        cost: from_micros(row.try_get("cost_micros")?),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn gate_from_row(row: &PgRow) -> StoreResult<Gate> {
    let resolution: String = row.try_get("resolution")?;
    let decision_input: Value = row.try_get("decision_input")?;
    let revise_tasks: Value = row.try_get("revise_tasks")?;

    Ok(Gate {
        gate_uuid: row.try_get("gate_uuid")?,
        execution_uuid: row.try_get("execution_uuid")?,
        phase: to_usize(row.try_get("phase")?),
        name: row.try_get("name")?,
        round: to_u32(row.try_get("round")?),
        decision_input: serde_json::from_value::<GateDecisionInput>(decision_input)?,
        resolution: parse::<GateResolution>(&resolution)?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
        notes: row.try_get("notes")?,
        revise_tasks: serde_json::from_value(revise_tasks)?,
        created_at: row.try_get("created_at")?,
    })
}

fn ledger_from_row(row: &PgRow, prefix: &str) -> StoreResult<ScopeLedger> {
    Ok(ScopeLedger {
        spent: from_micros(row.try_get(format!("{prefix}spent_micros").as_str())?),
        reserved: from_micros(row.try_get(format!("{prefix}reserved_micros").as_str())?),
        ceiling: from_micros(row.try_get(format!("{prefix}ceiling_micros").as_str())?),
    })
}

const TASK_COLUMNS: &str = "task_uuid, execution_uuid, phase, task_key, role, dependencies, \
    optional, status, attempts, max_attempts, last_error, last_message, invocation_uuid, \
    next_attempt_at, artifact, cost_micros, started_at, completed_at, created_at, updated_at";

const GATE_COLUMNS: &str = "gate_uuid, execution_uuid, phase, name, round, decision_input, \
    resolution, resolved_by, resolved_at, notes, revise_tasks, created_at";

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Apply the schema migrations under `migrations/`
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Database(error.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock project then execution ledger rows and read both
    async fn lock_ledgers(
        conn: &mut PgConnection,
        execution_uuid: Uuid,
    ) -> StoreResult<BudgetSnapshot> {
        let project = sqlx::query(
            "SELECT p.project_uuid, p.spent_micros, p.reserved_micros, p.ceiling_micros \
             FROM conductor_project_ledgers p \
             WHERE p.project_uuid = (SELECT project_uuid FROM conductor_execution_ledgers \
                                     WHERE execution_uuid = $1) \
             FOR UPDATE",
        )
        .bind(execution_uuid)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("execution ledger", execution_uuid))?;

        let execution = sqlx::query(
            "SELECT spent_micros, reserved_micros, ceiling_micros \
             FROM conductor_execution_ledgers WHERE execution_uuid = $1 FOR UPDATE",
        )
        .bind(execution_uuid)
        .fetch_one(&mut *conn)
        .await?;

        Ok(BudgetSnapshot {
            execution_uuid,
            project_uuid: project.try_get("project_uuid")?,
            execution: ledger_from_row(&execution, "")?,
            project: ledger_from_row(&project, "")?,
        })
    }

    async fn adjust_reserved(
        conn: &mut PgConnection,
        execution_uuid: Uuid,
        project_uuid: Uuid,
        delta_micros: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE conductor_execution_ledgers \
             SET reserved_micros = GREATEST(0, reserved_micros + $2) WHERE execution_uuid = $1",
        )
        .bind(execution_uuid)
        .bind(delta_micros)
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "UPDATE conductor_project_ledgers \
             SET reserved_micros = GREATEST(0, reserved_micros + $2) WHERE project_uuid = $1",
        )
        .bind(project_uuid)
        .bind(delta_micros)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn release_in(conn: &mut PgConnection, key: ChargeKey) -> StoreResult<()> {
        let released = sqlx::query(
            "DELETE FROM conductor_budget_reservations WHERE charge_key = $1 \
             RETURNING execution_uuid, project_uuid, amount_micros",
        )
        .bind(key.0)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = released {
            let amount: i64 = row.try_get("amount_micros")?;
            Self::adjust_reserved(
                conn,
                row.try_get("execution_uuid")?,
                row.try_get("project_uuid")?,
                -amount,
            )
            .await?;
        }
        Ok(())
    }

    async fn debit_in(
        conn: &mut PgConnection,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        let snapshot = Self::lock_ledgers(conn, execution_uuid).await?;
        Self::release_in(conn, key).await?;

        let already: Option<PgRow> =
            sqlx::query("SELECT 1 AS present FROM conductor_budget_charges WHERE charge_key = $1")
                .bind(key.0)
                .fetch_optional(&mut *conn)
                .await?;
        if already.is_some() {
            return Ok(ChargeOutcome::AlreadyCommitted);
        }

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

        let amount = to_micros(actual);
        let execution_spent: i64 = sqlx::query_scalar(
            "UPDATE conductor_execution_ledgers SET spent_micros = spent_micros + $2 \
             WHERE execution_uuid = $1 RETURNING spent_micros",
        )
        .bind(execution_uuid)
        .bind(amount)
        .fetch_one(&mut *conn)
        .await?;
        let project_spent: i64 = sqlx::query_scalar(
            "UPDATE conductor_project_ledgers SET spent_micros = spent_micros + $2 \
             WHERE project_uuid = $1 RETURNING spent_micros",
        )
        .bind(snapshot.project_uuid)
        .bind(amount)
        .fetch_one(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT INTO conductor_budget_charges (charge_key, execution_uuid, amount_micros) \
             VALUES ($1, $2, $3)",
        )
        .bind(key.0)
        .bind(execution_uuid)
        .bind(amount)
        .execute(&mut *conn)
        .await?;

        Ok(ChargeOutcome::Committed {
            execution_spent: from_micros(execution_spent),
            project_spent: from_micros(project_spent),
        })
    }

    async fn lock_task_state(
        conn: &mut PgConnection,
        transition: &NewTaskTransition,
    ) -> StoreResult<()> {
        let stored: Option<String> = sqlx::query_scalar(
            "SELECT status FROM conductor_tasks WHERE task_uuid = $1 FOR UPDATE",
        )
        .bind(transition.task_uuid)
        .fetch_optional(&mut *conn)
        .await?;

        match stored {
            None => Err(StoreError::not_found("task", transition.task_uuid)),
            Some(status) if transition.from_state.as_deref() != Some(status.as_str()) => {
                Err(StoreError::Conflict(format!(
                    "task {} is {status}, transition expected {:?}",
                    transition.task_uuid, transition.from_state
                )))
            }
            Some(_) => Ok(()),
        }
    }

    async fn write_task(
        conn: &mut PgConnection,
        task: &TaskRecord,
        transition: NewTaskTransition,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE conductor_tasks SET status = $2, attempts = $3, last_error = $4, \
             last_message = $5, invocation_uuid = $6, next_attempt_at = $7, artifact = $8, \
             cost_micros = $9, started_at = $10, completed_at = $11, updated_at = $12 \
             WHERE task_uuid = $1",
        )
        .bind(task.task_uuid)
        .bind(task.status.to_string())
        .bind(task.attempts as i32)
        .bind(&task.last_error)
        .bind(&task.last_message)
        .bind(task.invocation_uuid)
        .bind(task.next_attempt_at)
        .bind(&task.artifact)
        .bind(to_micros(task.cost))
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&mut *conn)
        .await?;

        Self::append_task_transition(conn, transition).await
    }

    async fn append_task_transition(
        conn: &mut PgConnection,
        transition: NewTaskTransition,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO conductor_task_transitions \
             (task_uuid, execution_uuid, sort_key, from_state, to_state, event, metadata, \
              created_at) \
             SELECT $1, $2, COALESCE(MAX(sort_key), 0) + 1, $3, $4, $5, $6, NOW() \
             FROM conductor_task_transitions WHERE task_uuid = $1",
        )
        .bind(transition.task_uuid)
        .bind(transition.execution_uuid)
        .bind(transition.from_state)
        .bind(transition.to_state)
        .bind(transition.event)
        .bind(transition.metadata)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn append_execution_transition(
        conn: &mut PgConnection,
        transition: NewExecutionTransition,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO conductor_execution_transitions \
             (execution_uuid, sort_key, from_state, to_state, event, metadata, created_at) \
             SELECT $1, COALESCE(MAX(sort_key), 0) + 1, $2, $3, $4, $5, NOW() \
             FROM conductor_execution_transitions WHERE execution_uuid = $1",
        )
        .bind(transition.execution_uuid)
        .bind(transition.from_state)
        .bind(transition.to_state)
        .bind(transition.event)
        .bind(transition.metadata)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_execution(
        &self,
        execution: &Execution,
        ceilings: &BudgetCeilings,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conductor_executions (execution_uuid, project_uuid, state, current_phase, \
             selected_roles, paused, progress, outcome, failure, started_at, completed_at, \
             updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (execution_uuid) DO NOTHING",
        )
        .bind(execution.execution_uuid)
        .bind(execution.project_uuid)
        .bind(execution.state.to_string())
        .bind(to_i32(execution.current_phase))
        .bind(serde_json::to_value(&execution.selected_roles)?)
        .bind(execution.paused)
        .bind(execution.progress)
        .bind(execution.outcome.to_string())
        .bind(execution.failure.as_ref().map(serde_json::to_value).transpose()?)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!(
                "execution {}",
                execution.execution_uuid
            )));
        }

        sqlx::query(
            "INSERT INTO conductor_project_ledgers (project_uuid, ceiling_micros) VALUES ($1, $2) \
             ON CONFLICT (project_uuid) DO NOTHING",
        )
        .bind(execution.project_uuid)
        .bind(to_micros(ceilings.project))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO conductor_execution_ledgers \
             (execution_uuid, project_uuid, ceiling_micros) VALUES ($1, $2, $3)",
        )
        .bind(execution.execution_uuid)
        .bind(execution.project_uuid)
        .bind(to_micros(ceilings.execution))
        .execute(&mut *tx)
        .await?;

        Self::append_execution_transition(
            &mut tx,
            NewExecutionTransition {
                execution_uuid: execution.execution_uuid,
                from_state: None,
                to_state: execution.state.to_string(),
                event: "create".to_string(),
                metadata: json!({ "selected_roles": execution.selected_roles }),
            },
        )
        .await?;

        tx.commit().await?;
        debug!(execution_uuid = %execution.execution_uuid, "Execution persisted");
        Ok(())
    }

    async fn get_execution(&self, execution_uuid: Uuid) -> StoreResult<Execution> {
        let row = sqlx::query("SELECT * FROM conductor_executions WHERE execution_uuid = $1")
            .bind(execution_uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("execution", execution_uuid))?;
        execution_from_row(&row)
    }

    async fn load_records(&self, execution_uuid: Uuid) -> StoreResult<ExecutionRecords> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let execution_row =
            sqlx::query("SELECT * FROM conductor_executions WHERE execution_uuid = $1")
                .bind(execution_uuid)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("execution", execution_uuid))?;
        let task_rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM conductor_tasks WHERE execution_uuid = $1 \
             ORDER BY phase, created_at, task_key"
        ))
        .bind(execution_uuid)
        .fetch_all(&mut *tx)
        .await?;
        let gate_rows = sqlx::query(&format!(
            "SELECT {GATE_COLUMNS} FROM conductor_gates WHERE execution_uuid = $1 \
             ORDER BY phase, round"
        ))
        .bind(execution_uuid)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ExecutionRecords {
            execution: execution_from_row(&execution_row)?,
            tasks: task_rows.iter().map(task_from_row).collect::<StoreResult<_>>()?,
            gates: gate_rows.iter().map(gate_from_row).collect::<StoreResult<_>>()?,
        })
    }

    async fn save_execution(
        &self,
        execution: &Execution,
        transition: Option<NewExecutionTransition>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let stored: String = sqlx::query_scalar(
            "SELECT state FROM conductor_executions WHERE execution_uuid = $1 FOR UPDATE",
        )
        .bind(execution.execution_uuid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("execution", execution.execution_uuid))?;

        let expected = match &transition {
            Some(transition) => transition.from_state.clone(),
            None => Some(execution.state.to_string()),
        };
        if expected.as_deref() != Some(stored.as_str()) {
            return Err(StoreError::Conflict(format!(
                "execution {} is {stored}, write expected {expected:?}",
                execution.execution_uuid
            )));
        }

        sqlx::query(
            "UPDATE conductor_executions SET state = $2, current_phase = $3, paused = $4, \
             progress = $5, outcome = $6, failure = $7, completed_at = $8, updated_at = $9 \
             WHERE execution_uuid = $1",
        )
        .bind(execution.execution_uuid)
        .bind(execution.state.to_string())
        .bind(to_i32(execution.current_phase))
        .bind(execution.paused)
        .bind(execution.progress)
        .bind(execution.outcome.to_string())
        .bind(execution.failure.as_ref().map(serde_json::to_value).transpose()?)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(transition) = transition {
            Self::append_execution_transition(&mut tx, transition).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_unfinished_executions(&self) -> StoreResult<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT * FROM conductor_executions \
             WHERE state NOT IN ('completed', 'failed', 'cancelled') ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn list_execution_transitions(
        &self,
        execution_uuid: Uuid,
    ) -> StoreResult<Vec<ExecutionTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM conductor_execution_transitions WHERE execution_uuid = $1 \
             ORDER BY sort_key",
        )
        .bind(execution_uuid)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Err(StoreError::not_found("execution", execution_uuid));
        }

        rows.iter()
            .map(|row| {
                Ok(ExecutionTransition {
                    execution_uuid: row.try_get("execution_uuid")?,
                    sort_key: row.try_get("sort_key")?,
                    from_state: row.try_get("from_state")?,
                    to_state: row.try_get("to_state")?,
                    event: row.try_get("event")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn insert_tasks(&self, tasks: &[TaskRecord]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            let inserted = sqlx::query(&format!(
                "INSERT INTO conductor_tasks ({TASK_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                  $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
                 ON CONFLICT (task_uuid) DO NOTHING"
            ))
            .bind(task.task_uuid)
            .bind(task.execution_uuid)
            .bind(to_i32(task.phase))
            .bind(&task.task_key)
            .bind(task.role.as_str())
            .bind(serde_json::to_value(&task.dependencies)?)
            .bind(task.optional)
            .bind(task.status.to_string())
            .bind(task.attempts as i32)
            .bind(task.max_attempts as i32)
            .bind(&task.last_error)
            .bind(&task.last_message)
            .bind(task.invocation_uuid)
            .bind(task.next_attempt_at)
            .bind(&task.artifact)
            .bind(to_micros(task.cost))
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::Duplicate(format!("task {}", task.task_uuid)));
            }

            Self::append_task_transition(
                &mut tx,
                NewTaskTransition {
                    task_uuid: task.task_uuid,
                    execution_uuid: task.execution_uuid,
                    from_state: None,
                    to_state: task.status.to_string(),
                    event: "create".to_string(),
                    metadata: json!({ "phase": task.phase + 1, "role": task.role }),
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_tasks(&self, execution_uuid: Uuid) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM conductor_tasks WHERE execution_uuid = $1 \
             ORDER BY phase, created_at, task_key"
        ))
        .bind(execution_uuid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn get_task(&self, task_uuid: Uuid) -> StoreResult<TaskRecord> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM conductor_tasks WHERE task_uuid = $1"
        ))
        .bind(task_uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("task", task_uuid))?;
        task_from_row(&row)
    }

    async fn save_task(
        &self,
        task: &TaskRecord,
        transition: NewTaskTransition,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_task_state(&mut tx, &transition).await?;
        Self::write_task(&mut tx, task, transition).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_task_message(
        &self,
        task_uuid: Uuid,
        invocation_uuid: Uuid,
        message: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE conductor_tasks SET last_message = $3, updated_at = NOW() \
             WHERE task_uuid = $1 AND invocation_uuid = $2",
        )
        .bind(task_uuid)
        .bind(invocation_uuid)
        .bind(message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM conductor_tasks WHERE task_uuid = $1")
                .bind(task_uuid)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::not_found("task", task_uuid));
            }
        }
        Ok(())
    }

    async fn list_task_transitions(&self, task_uuid: Uuid) -> StoreResult<Vec<TaskTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM conductor_task_transitions WHERE task_uuid = $1 ORDER BY sort_key",
        )
        .bind(task_uuid)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Err(StoreError::not_found("task", task_uuid));
        }

        rows.iter()
            .map(|row| {
                Ok(TaskTransition {
                    task_uuid: row.try_get("task_uuid")?,
                    execution_uuid: row.try_get("execution_uuid")?,
                    sort_key: row.try_get("sort_key")?,
                    from_state: row.try_get("from_state")?,
                    to_state: row.try_get("to_state")?,
                    event: row.try_get("event")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn insert_gate(&self, gate: &Gate) -> StoreResult<()> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO conductor_gates ({GATE_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) ON CONFLICT DO NOTHING"
        ))
        .bind(gate.gate_uuid)
        .bind(gate.execution_uuid)
        .bind(to_i32(gate.phase))
        .bind(&gate.name)
        .bind(gate.round as i32)
        .bind(serde_json::to_value(&gate.decision_input)?)
        .bind(gate.resolution.to_string())
        .bind(&gate.resolved_by)
        .bind(gate.resolved_at)
        .bind(&gate.notes)
        .bind(serde_json::to_value(&gate.revise_tasks)?)
        .bind(gate.created_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("gate {}", gate.gate_uuid)));
        }
        Ok(())
    }

    async fn get_gate(&self, gate_uuid: Uuid) -> StoreResult<Gate> {
        let row = sqlx::query(&format!(
            "SELECT {GATE_COLUMNS} FROM conductor_gates WHERE gate_uuid = $1"
        ))
        .bind(gate_uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("gate", gate_uuid))?;
        gate_from_row(&row)
    }

    async fn list_gates(&self, execution_uuid: Uuid) -> StoreResult<Vec<Gate>> {
        let rows = sqlx::query(&format!(
            "SELECT {GATE_COLUMNS} FROM conductor_gates WHERE execution_uuid = $1 \
             ORDER BY phase, round"
        ))
        .bind(execution_uuid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(gate_from_row).collect()
    }

    async fn resolve_gate(&self, gate: &Gate) -> StoreResult<GateResolveOutcome> {
        let updated = sqlx::query(&format!(
            "UPDATE conductor_gates SET resolution = $2, resolved_by = $3, resolved_at = $4, \
             notes = $5, revise_tasks = $6 \
             WHERE gate_uuid = $1 AND resolution = 'pending' RETURNING {GATE_COLUMNS}"
        ))
        .bind(gate.gate_uuid)
        .bind(gate.resolution.to_string())
        .bind(&gate.resolved_by)
        .bind(gate.resolved_at)
        .bind(&gate.notes)
        .bind(serde_json::to_value(&gate.revise_tasks)?)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => Ok(GateResolveOutcome::Resolved(gate_from_row(&row)?)),
            None => Ok(GateResolveOutcome::AlreadyResolved(
                self.get_gate(gate.gate_uuid).await?,
            )),
        }
    }

    async fn budget_snapshot(&self, execution_uuid: Uuid) -> StoreResult<BudgetSnapshot> {
        let row = sqlx::query(
            "SELECT e.project_uuid, e.spent_micros, e.reserved_micros, e.ceiling_micros, \
             p.spent_micros AS p_spent_micros, p.reserved_micros AS p_reserved_micros, \
             p.ceiling_micros AS p_ceiling_micros \
             FROM conductor_execution_ledgers e \
             JOIN conductor_project_ledgers p ON p.project_uuid = e.project_uuid \
             WHERE e.execution_uuid = $1",
        )
        .bind(execution_uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("execution ledger", execution_uuid))?;

        Ok(BudgetSnapshot {
            execution_uuid,
            project_uuid: row.try_get("project_uuid")?,
            execution: ledger_from_row(&row, "")?,
            project: ledger_from_row(&row, "p_")?,
        })
    }

    async fn update_ceilings(
        &self,
        execution_uuid: Uuid,
        update: CeilingUpdate,
    ) -> StoreResult<BudgetSnapshot> {
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::lock_ledgers(&mut tx, execution_uuid).await?;

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

        if let Some(ceiling) = update.execution {
            sqlx::query(
                "UPDATE conductor_execution_ledgers SET ceiling_micros = $2 \
                 WHERE execution_uuid = $1",
            )
            .bind(execution_uuid)
            .bind(to_micros(ceiling))
            .execute(&mut *tx)
            .await?;
        }
        if let Some(ceiling) = update.project {
            sqlx::query(
                "UPDATE conductor_project_ledgers SET ceiling_micros = $2 WHERE project_uuid = $1",
            )
            .bind(snapshot.project_uuid)
            .bind(to_micros(ceiling))
            .execute(&mut *tx)
            .await?;
        }

        let updated = Self::lock_ledgers(&mut tx, execution_uuid).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn reserve_budget(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        estimate: Cost,
    ) -> StoreResult<BudgetDecision> {
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::lock_ledgers(&mut tx, execution_uuid).await?;

        let existing: Option<PgRow> = sqlx::query(
            "SELECT 1 AS present FROM conductor_budget_reservations WHERE charge_key = $1 \
             UNION ALL SELECT 1 FROM conductor_budget_charges WHERE charge_key = $1",
        )
        .bind(key.0)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(BudgetDecision::Admitted);
        }

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

        sqlx::query(
            "INSERT INTO conductor_budget_reservations \
             (charge_key, execution_uuid, project_uuid, amount_micros) VALUES ($1, $2, $3, $4)",
        )
        .bind(key.0)
        .bind(execution_uuid)
        .bind(snapshot.project_uuid)
        .bind(to_micros(estimate))
        .execute(&mut *tx)
        .await?;
        Self::adjust_reserved(&mut tx, execution_uuid, snapshot.project_uuid, to_micros(estimate))
            .await?;

        tx.commit().await?;
        Ok(BudgetDecision::Admitted)
    }

    async fn release_reservation(&self, execution_uuid: Uuid, key: ChargeKey) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_ledgers(&mut tx, execution_uuid).await?;
        Self::release_in(&mut tx, key).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release_all_reservations(&self, execution_uuid: Uuid) -> StoreResult<Cost> {
        let mut tx = self.pool.begin().await?;
        Self::lock_ledgers(&mut tx, execution_uuid).await?;
        let keys: Vec<Uuid> = sqlx::query_scalar(
            "SELECT charge_key FROM conductor_budget_reservations WHERE execution_uuid = $1",
        )
        .bind(execution_uuid)
        .fetch_all(&mut *tx)
        .await?;
        let released: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(amount_micros)::BIGINT FROM conductor_budget_reservations \
             WHERE execution_uuid = $1",
        )
        .bind(execution_uuid)
        .fetch_one(&mut *tx)
        .await?;
        for key in keys {
            Self::release_in(&mut tx, ChargeKey(key)).await?;
        }
        tx.commit().await?;
        Ok(from_micros(released.unwrap_or(0)))
    }

    async fn commit_charge(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::debit_in(&mut tx, execution_uuid, key, actual).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn complete_task_with_charge(
        &self,
        task: &TaskRecord,
        transition: NewTaskTransition,
        key: ChargeKey,
        actual: Cost,
    ) -> StoreResult<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::lock_task_state(&mut tx, &transition).await?;

        let outcome = Self::debit_in(&mut tx, task.execution_uuid, key, actual).await?;
        if outcome.is_accepted() {
            Self::write_task(&mut tx, task, transition).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}
