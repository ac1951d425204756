use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    actions::{RecordAttemptAction, RecordOutcomeAction, ResetAttemptsAction, StateAction},
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    guards::{
        DependencyStatuses, StateGuard, TaskAttemptsExhaustedGuard, TaskCanBeRetriedGuard,
        TaskDependenciesMetGuard, TaskIsOptionalGuard,
    },
    states::TaskStatus,
};
use crate::constants::events as event_names;
use crate::database::ExecutionStore;
use crate::events::EventPublisher;
use crate::models::{ChargeKey, ChargeOutcome, Cost, NewTaskTransition, TaskRecord};

/// Task lifecycle state machine
///
/// Every accepted transition is written to the store together with its
/// transition row. The store rejects the write when the persisted status no
/// longer matches the status this machine started from.
#[derive(Clone)]
pub struct TaskStateMachine {
    task: TaskRecord,
    store: Arc<dyn ExecutionStore>,
    event_publisher: Arc<EventPublisher>,
}

impl std::fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateMachine")
            .field("task_uuid", &self.task.task_uuid)
            .field("status", &self.task.status)
            .finish()
    }
}

impl TaskStateMachine {
    pub fn new(
        task: TaskRecord,
        store: Arc<dyn ExecutionStore>,
        event_publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            task,
            store,
            event_publisher,
        }
    }

    /// Load the task from the store and build a machine for it
    pub async fn for_task(
        task_uuid: Uuid,
        store: Arc<dyn ExecutionStore>,
        event_publisher: Arc<EventPublisher>,
    ) -> StateMachineResult<Self> {
        let task = store.get_task(task_uuid).await?;
        Ok(Self::new(task, store, event_publisher))
    }

    pub fn current_state(&self) -> TaskStatus {
        self.task.status
    }

    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn into_task(self) -> TaskRecord {
        self.task
    }

    /// Attempt to transition the task, returning the new status
    pub async fn transition(
        &mut self,
        event: TaskEvent,
        statuses: &DependencyStatuses,
    ) -> StateMachineResult<TaskStatus> {
        let (updated, transition) = self.prepare(&event, statuses)?;
        self.store.save_task(&updated, transition).await?;
        self.apply(updated, &event).await;
        Ok(self.task.status)
    }

    /// Complete the task and debit its actual cost in one atomic store write
    ///
    /// When the debit would cross a ceiling nothing is written and the
    /// rejection is returned to the caller.
    pub async fn transition_with_charge(
        &mut self,
        event: TaskEvent,
        key: ChargeKey,
        actual: Cost,
    ) -> StateMachineResult<ChargeOutcome> {
        if !matches!(event, TaskEvent::Complete { .. }) {
            return Err(StateMachineError::Internal(format!(
                "charged transitions only accept completion, got {}",
                event.event_type()
            )));
        }

        let (mut updated, transition) = self.prepare(&event, &DependencyStatuses::new())?;
        updated.cost = updated.cost.saturating_add(actual);

        let outcome = self
            .store
            .complete_task_with_charge(&updated, transition, key, actual)
            .await?;

        if outcome.is_accepted() {
            self.apply(updated, &event).await;
        }
        Ok(outcome)
    }

    /// Determine the target status for an event (exposed for testing)
    pub fn determine_target_state(
        &self,
        current_state: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        use TaskEvent::*;
        use TaskStatus::*;

        let target = match (current_state, event) {
            (Pending, Start { .. }) | (Failed, Start { .. }) => Running,

            // Build-style chain
            (Running, Deploy) => Deploying,
            (Deploying, RunTests) => Testing,
            (Testing, TestsPassed) => Passed,
            (Passed, TaskEvent::Commit) => Committing,

            (Running, Complete { .. }) | (Committing, Complete { .. }) => Completed,

            (state, Fail { .. }) if state.is_active() => Failed,
            (Failed, Exhaust) => Blocked,
            (state, Block(_)) if state == Pending || state == Failed || state.is_active() => {
                Blocked
            }

            (Pending, Skip) | (Failed, Skip) | (Blocked, Skip) => Skipped,

            (Failed, Reset) | (Blocked, Reset) | (Completed, Reset) | (Skipped, Reset) => Pending,

            (Pending, ResolveManually { .. })
            | (Failed, ResolveManually { .. })
            | (Blocked, ResolveManually { .. }) => Completed,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from_state.to_string()),
                    to: format!("{event:?}"),
                })
            }
        };

        Ok(target)
    }

    fn check_guards(
        &self,
        current_state: TaskStatus,
        event: &TaskEvent,
        statuses: &DependencyStatuses,
    ) -> StateMachineResult<()> {
        let task = &self.task;
        match (current_state, event) {
            (TaskStatus::Pending, TaskEvent::Start { .. }) => {
                TaskDependenciesMetGuard.check(task, statuses)?;
            }
            (TaskStatus::Failed, TaskEvent::Start { .. }) => {
                TaskCanBeRetriedGuard.check(task, statuses)?;
                TaskDependenciesMetGuard.check(task, statuses)?;
            }
            (_, TaskEvent::Exhaust) => {
                TaskAttemptsExhaustedGuard.check(task, statuses)?;
            }
            (_, TaskEvent::Skip) => {
                TaskIsOptionalGuard.check(task, statuses)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn prepare(
        &self,
        event: &TaskEvent,
        statuses: &DependencyStatuses,
    ) -> StateMachineResult<(TaskRecord, NewTaskTransition)> {
        let current_state = self.task.status;
        let target_state = self.determine_target_state(current_state, event)?;
        self.check_guards(current_state, event, statuses)?;

        let now = Utc::now();
        let mut updated = self.task.clone();
        let actions: [&dyn StateAction<TaskRecord, State = TaskStatus, Event = TaskEvent>; 3] = [
            &RecordAttemptAction,
            &RecordOutcomeAction,
            &ResetAttemptsAction,
        ];
        for action in actions {
            action.execute(&mut updated, &current_state, &target_state, event, now);
        }
        updated.status = target_state;
        updated.updated_at = now;

        let transition = NewTaskTransition {
            task_uuid: updated.task_uuid,
            execution_uuid: updated.execution_uuid,
            from_state: Some(current_state.to_string()),
            to_state: target_state.to_string(),
            event: event.event_type().to_string(),
            metadata: json!({
                "attempt": updated.attempts,
                "max_attempts": updated.max_attempts,
                "invocation_uuid": updated.invocation_uuid,
                "error": updated.last_error.as_deref().filter(|_| event.error_message().is_some()),
                "retry_at": updated.next_attempt_at,
            }),
        };

        Ok((updated, transition))
    }

    async fn apply(&mut self, updated: TaskRecord, event: &TaskEvent) {
        let from_state = self.task.status;
        self.task = updated;

        debug!(
            task_uuid = %self.task.task_uuid,
            task_key = %self.task.task_key,
            from_state = %from_state,
            to_state = %self.task.status,
            event = event.event_type(),
            attempt = self.task.attempts,
            "Task transitioned"
        );

        let _ = self
            .event_publisher
            .publish(
                event_names::TASK_STATE_CHANGED,
                json!({
                    "execution_uuid": self.task.execution_uuid,
                    "task_uuid": self.task.task_uuid,
                    "task_key": self.task.task_key,
                    "from_state": from_state.to_string(),
                    "to_state": self.task.status.to_string(),
                    "event": event.event_type(),
                    "attempt": self.task.attempts,
                }),
            )
            .await;
    }
}
