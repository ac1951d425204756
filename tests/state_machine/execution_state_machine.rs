use conductor_core::database::{ExecutionStore, InMemoryStore};
use conductor_core::events::EventPublisher;
use conductor_core::models::{BudgetScope, Cost, Execution, ExecutionOutcome, FailureReason};
use conductor_core::registry::AgentRoleId;
use conductor_core::state_machine::{
    ExecutionEvent, ExecutionState, ExecutionStateMachine, StateMachineError,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::ceilings;

async fn machine(phase_count: usize) -> (ExecutionStateMachine, Arc<dyn ExecutionStore>) {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
    let execution = Execution::new(Uuid::new_v4(), vec![AgentRoleId::from("solution_architect")]);
    store
        .create_execution(&execution, &ceilings(100.0, 1_000.0))
        .await
        .unwrap();
    let machine = ExecutionStateMachine::new(
        execution,
        phase_count,
        Arc::clone(&store),
        Arc::new(EventPublisher::new(64)),
    );
    (machine, store)
}

fn budget_failure() -> FailureReason {
    FailureReason::BudgetExceeded {
        scope: BudgetScope::Execution,
        task_uuid: None,
        attempted: Cost::from_dollars(12.0),
        spent: Cost::from_dollars(45.0),
        ceiling: Cost::from_dollars(50.0),
    }
}

#[tokio::test]
async fn test_ungated_pipeline_advances_to_completion() {
    let (mut machine, store) = machine(2).await;

    for (event, expected) in [
        (ExecutionEvent::Start, "phase_1_running"),
        (ExecutionEvent::CompletePhase, "phase_1_complete"),
        (ExecutionEvent::Advance, "phase_2_running"),
        (ExecutionEvent::CompletePhase, "phase_2_complete"),
        (ExecutionEvent::Finish, "completed"),
    ] {
        let state = machine.transition(event).await.unwrap();
        assert_eq!(state.to_string(), expected);
    }

    let execution = store
        .get_execution(machine.execution().execution_uuid)
        .await
        .unwrap();
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.outcome, ExecutionOutcome::Success);
    assert_eq!(execution.current_phase, 1);
    assert!((execution.progress - 100.0).abs() < f64::EPSILON);
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn test_finish_refused_before_last_phase() {
    let (mut machine, _) = machine(3).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();

    let result = machine.transition(ExecutionEvent::Finish).await;
    assert!(matches!(
        result,
        Err(StateMachineError::InvalidTransition { .. })
    ));
    assert_eq!(machine.current_state(), &ExecutionState::PhaseComplete(0));
}

#[tokio::test]
async fn test_gate_approval_moves_to_next_phase() {
    let (mut machine, _) = machine(2).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();
    let waiting = machine
        .transition(ExecutionEvent::AwaitGate("requirements_review".to_string()))
        .await
        .unwrap();
    assert_eq!(waiting.to_string(), "waiting_requirements_review");
    assert_eq!(machine.execution().current_phase, 0);

    let next = machine.transition(ExecutionEvent::ApproveGate).await.unwrap();
    assert_eq!(next, ExecutionState::PhaseRunning(1));
}

#[tokio::test]
async fn test_gate_revision_reruns_same_phase() {
    let (mut machine, _) = machine(3).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();
    machine
        .transition(ExecutionEvent::AwaitGate("requirements_review".to_string()))
        .await
        .unwrap();

    let rerun = machine.transition(ExecutionEvent::ReviseGate).await.unwrap();
    assert_eq!(rerun, ExecutionState::PhaseRunning(0));
}

#[tokio::test]
async fn test_approval_on_last_phase_completes() {
    let (mut machine, _) = machine(1).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();
    machine
        .transition(ExecutionEvent::AwaitGate("final_review".to_string()))
        .await
        .unwrap();
    assert_eq!(
        machine.transition(ExecutionEvent::ApproveGate).await.unwrap(),
        ExecutionState::Completed
    );
}

#[tokio::test]
async fn test_gate_rejection_cancels() {
    let (mut machine, _) = machine(2).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();
    machine
        .transition(ExecutionEvent::AwaitGate("requirements_review".to_string()))
        .await
        .unwrap();

    assert_eq!(
        machine.transition(ExecutionEvent::RejectGate).await.unwrap(),
        ExecutionState::Cancelled
    );
    assert_eq!(machine.execution().outcome, ExecutionOutcome::Cancelled);
}

#[tokio::test]
async fn test_failure_records_reason_and_retry_clears_it() {
    let (mut machine, store) = machine(2).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine
        .transition(ExecutionEvent::Fail(budget_failure()))
        .await
        .unwrap();

    let failed = store
        .get_execution(machine.execution().execution_uuid)
        .await
        .unwrap();
    assert_eq!(failed.state, ExecutionState::Failed);
    assert!(failed
        .failure
        .as_ref()
        .is_some_and(FailureReason::is_budget_exhaustion));

    let resumed = machine.transition(ExecutionEvent::Retry).await.unwrap();
    assert_eq!(resumed, ExecutionState::PhaseRunning(0));
    assert!(machine.execution().failure.is_none());
}

#[tokio::test]
async fn test_terminal_states_reject_further_events() {
    let (mut machine, _) = machine(2).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::Cancel).await.unwrap();

    for event in [
        ExecutionEvent::Cancel,
        ExecutionEvent::Retry,
        ExecutionEvent::Fail(budget_failure()),
        ExecutionEvent::Start,
    ] {
        let result = machine.transition(event).await;
        assert!(matches!(
            result,
            Err(StateMachineError::InvalidTransition { .. })
        ));
    }
    assert_eq!(machine.current_state(), &ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_await_gate_requires_a_name() {
    let (mut machine, _) = machine(2).await;
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();

    let result = machine.transition(ExecutionEvent::AwaitGate(String::new())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_save_rejects_state_change() {
    let (mut machine, _) = machine(2).await;
    let mut changed = machine.execution().clone();
    changed.state = ExecutionState::Completed;

    let result = machine.save(changed).await;
    assert!(matches!(result, Err(StateMachineError::Internal(_))));

    let mut paused = machine.execution().clone();
    paused.paused = true;
    machine.save(paused).await.unwrap();
    assert!(machine.execution().paused);
}
