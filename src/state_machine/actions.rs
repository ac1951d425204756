//! Record updates applied after a transition has been accepted and before it
//! is persisted, so the stored record and its transition row always agree.

use chrono::{DateTime, Utc};

use super::events::{ExecutionEvent, TaskEvent};
use super::states::{ExecutionState, TaskStatus};
use crate::constants::sanitize_error_detail;
use crate::models::{Execution, ExecutionOutcome, TaskRecord};

/// Trait for record updates tied to a transition
pub trait StateAction<T> {
    type State;
    type Event;

    fn execute(
        &self,
        entity: &mut T,
        from_state: &Self::State,
        to_state: &Self::State,
        event: &Self::Event,
        now: DateTime<Utc>,
    );

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Counts the attempt and stamps the invocation on entry into `running`
pub struct RecordAttemptAction;

impl StateAction<TaskRecord> for RecordAttemptAction {
    type State = TaskStatus;
    type Event = TaskEvent;

    fn execute(
        &self,
        task: &mut TaskRecord,
        _from_state: &TaskStatus,
        to_state: &TaskStatus,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) {
        if let (TaskStatus::Running, TaskEvent::Start { invocation_uuid }) = (to_state, event) {
            task.attempts += 1;
            task.invocation_uuid = Some(*invocation_uuid);
            task.started_at = Some(now);
            task.completed_at = None;
            task.next_attempt_at = None;
            task.last_message = None;
        }
    }

    fn description(&self) -> &'static str {
        "Record attempt start"
    }
}

/// Stamps completion time, artifacts and sanitized error detail
pub struct RecordOutcomeAction;

impl StateAction<TaskRecord> for RecordOutcomeAction {
    type State = TaskStatus;
    type Event = TaskEvent;

    fn execute(
        &self,
        task: &mut TaskRecord,
        _from_state: &TaskStatus,
        to_state: &TaskStatus,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) {
        if to_state.is_terminal() || *to_state == TaskStatus::Failed {
            task.completed_at = Some(now);
        }

        match event {
            TaskEvent::Complete { artifact } | TaskEvent::ResolveManually { artifact } => {
                if artifact.is_some() {
                    task.artifact = artifact.clone();
                }
                task.last_error = None;
                task.next_attempt_at = None;
            }
            TaskEvent::Fail { error, retry_at } => {
                task.last_error = Some(sanitize_error_detail(error));
                task.next_attempt_at = *retry_at;
            }
            TaskEvent::Block(reason) => {
                task.last_error = Some(sanitize_error_detail(reason));
                task.next_attempt_at = None;
            }
            _ => {}
        }
    }

    fn description(&self) -> &'static str {
        "Record attempt outcome"
    }
}

/// Clears attempt bookkeeping when a task goes back to `pending`
pub struct ResetAttemptsAction;

impl StateAction<TaskRecord> for ResetAttemptsAction {
    type State = TaskStatus;
    type Event = TaskEvent;

    fn execute(
        &self,
        task: &mut TaskRecord,
        _from_state: &TaskStatus,
        to_state: &TaskStatus,
        event: &TaskEvent,
        _now: DateTime<Utc>,
    ) {
        if let (TaskStatus::Pending, TaskEvent::Reset) = (to_state, event) {
            task.attempts = 0;
            task.last_error = None;
            task.last_message = None;
            task.invocation_uuid = None;
            task.next_attempt_at = None;
            task.started_at = None;
            task.completed_at = None;
            task.artifact = None;
        }
    }

    fn description(&self) -> &'static str {
        "Reset attempts for rerun"
    }
}

/// Keeps phase index, outcome, failure reason and timestamps in step with the state
pub struct UpdateExecutionOutcomeAction;

impl StateAction<Execution> for UpdateExecutionOutcomeAction {
    type State = ExecutionState;
    type Event = ExecutionEvent;

    fn execute(
        &self,
        execution: &mut Execution,
        _from_state: &ExecutionState,
        to_state: &ExecutionState,
        event: &ExecutionEvent,
        now: DateTime<Utc>,
    ) {
        if let Some(index) = to_state.phase_index() {
            execution.current_phase = index;
        }

        match to_state {
            ExecutionState::Completed => {
                execution.outcome = ExecutionOutcome::Success;
                execution.progress = 100.0;
                execution.completed_at = Some(now);
            }
            ExecutionState::Failed => {
                execution.outcome = ExecutionOutcome::Failed;
                execution.failure = event.failure_reason().cloned();
                execution.completed_at = Some(now);
            }
            ExecutionState::Cancelled => {
                execution.outcome = ExecutionOutcome::Cancelled;
                execution.completed_at = Some(now);
            }
            _ => {}
        }

        if let ExecutionEvent::Retry = event {
            execution.outcome = ExecutionOutcome::None;
            execution.failure = None;
            execution.completed_at = None;
        }
    }

    fn description(&self) -> &'static str {
        "Update execution outcome"
    }
}
