use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{
    actions::{StateAction, UpdateExecutionOutcomeAction},
    errors::{StateMachineError, StateMachineResult},
    events::ExecutionEvent,
    states::ExecutionState,
};
use crate::constants::events as event_names;
use crate::database::ExecutionStore;
use crate::events::EventPublisher;
use crate::models::{Execution, NewExecutionTransition};

/// Phase-level lifecycle state machine for one execution
///
/// The machine needs the pipeline's phase count to decide whether a
/// completed phase advances or finishes the execution.
#[derive(Clone)]
pub struct ExecutionStateMachine {
    execution: Execution,
    phase_count: usize,
    store: Arc<dyn ExecutionStore>,
    event_publisher: Arc<EventPublisher>,
}

impl std::fmt::Debug for ExecutionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStateMachine")
            .field("execution_uuid", &self.execution.execution_uuid)
            .field("state", &self.execution.state)
            .field("phase_count", &self.phase_count)
            .finish()
    }
}

impl ExecutionStateMachine {
    pub fn new(
        execution: Execution,
        phase_count: usize,
        store: Arc<dyn ExecutionStore>,
        event_publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            execution,
            phase_count,
            store,
            event_publisher,
        }
    }

    pub fn current_state(&self) -> &ExecutionState {
        &self.execution.state
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn into_execution(self) -> Execution {
        self.execution
    }

    fn is_last_phase(&self, index: usize) -> bool {
        index + 1 >= self.phase_count
    }

    /// Determine the target state for an event (exposed for testing)
    pub fn determine_target_state(
        &self,
        current_state: &ExecutionState,
        event: &ExecutionEvent,
    ) -> StateMachineResult<ExecutionState> {
        use ExecutionEvent::*;
        use ExecutionState::*;

        let current_phase = self.execution.current_phase;
        let target = match (current_state, event) {
            (Initialized, Start) => PhaseRunning(0),

            (PhaseRunning(n), CompletePhase) => PhaseComplete(*n),

            (PhaseComplete(_), AwaitGate(gate)) if !gate.is_empty() => Waiting {
                gate: gate.clone(),
            },
            (PhaseComplete(n), Advance) if !self.is_last_phase(*n) => PhaseRunning(n + 1),
            (PhaseComplete(n), Finish) if self.is_last_phase(*n) => Completed,

            (Waiting { .. }, ApproveGate) if self.is_last_phase(current_phase) => Completed,
            (Waiting { .. }, ApproveGate) => PhaseRunning(current_phase + 1),
            (Waiting { .. }, ReviseGate) => PhaseRunning(current_phase),
            (Waiting { .. }, RejectGate) => Cancelled,

            (state, Fail(_)) if !state.is_terminal() => Failed,
            (state, Cancel) if !state.is_terminal() => Cancelled,

            // Operator-initiated recovery is the only way out of a terminal state
            (Failed, Retry) => PhaseRunning(current_phase),

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from_state.to_string()),
                    to: format!("{event:?}"),
                })
            }
        };

        Ok(target)
    }

    /// Attempt to transition the execution, returning the new state
    pub async fn transition(
        &mut self,
        event: ExecutionEvent,
    ) -> StateMachineResult<ExecutionState> {
        let current_state = self.execution.state.clone();
        let target_state = self.determine_target_state(&current_state, &event)?;

        let now = Utc::now();
        let mut updated = self.execution.clone();
        UpdateExecutionOutcomeAction.execute(
            &mut updated,
            &current_state,
            &target_state,
            &event,
            now,
        );
        updated.state = target_state.clone();
        updated.updated_at = now;

        let transition = NewExecutionTransition {
            execution_uuid: updated.execution_uuid,
            from_state: Some(current_state.to_string()),
            to_state: target_state.to_string(),
            event: event.event_type().to_string(),
            metadata: json!({
                "phase": updated.current_phase + 1,
                "failure": updated.failure.as_ref().map(|reason| reason.to_string()),
                "failure_kind": updated.failure.as_ref().map(|reason| reason.label()),
            }),
        };

        self.store.save_execution(&updated, Some(transition)).await?;
        self.execution = updated;

        info!(
            execution_uuid = %self.execution.execution_uuid,
            from_state = %current_state,
            to_state = %target_state,
            event = event.event_type(),
            "Execution transitioned"
        );

        let _ = self
            .event_publisher
            .publish(
                event_names::EXECUTION_STATE_CHANGED,
                json!({
                    "execution_uuid": self.execution.execution_uuid,
                    "project_uuid": self.execution.project_uuid,
                    "from_state": current_state.to_string(),
                    "to_state": target_state.to_string(),
                    "event": event.event_type(),
                }),
            )
            .await;

        Ok(target_state)
    }

    /// Persist non-transition fields such as the pause flag or recorded progress
    pub async fn save(&mut self, execution: Execution) -> StateMachineResult<()> {
        if execution.state != self.execution.state {
            return Err(StateMachineError::Internal(
                "state changes must go through transition()".to_string(),
            ));
        }
        let mut execution = execution;
        execution.updated_at = Utc::now();
        self.store.save_execution(&execution, None).await?;
        self.execution = execution;
        Ok(())
    }
}
