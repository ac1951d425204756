//! Compare-and-set persistence and event publication of state transitions.

use conductor_core::constants::events;
use conductor_core::database::{ExecutionStore, GateResolveOutcome, InMemoryStore, StoreError};
use conductor_core::events::EventPublisher;
use conductor_core::models::{
    Execution, Gate, GateDecisionInput, GateResolution, TaskRecord,
};
use conductor_core::registry::AgentRoleId;
use conductor_core::state_machine::{
    DependencyStatuses, ExecutionEvent, ExecutionStateMachine, StateMachineError, TaskEvent,
    TaskStateMachine, TaskStatus,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::ceilings;

async fn seeded_store() -> (Arc<dyn ExecutionStore>, Execution) {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
    let execution = Execution::new(Uuid::new_v4(), vec![AgentRoleId::from("requirements_analyst")]);
    store
        .create_execution(&execution, &ceilings(100.0, 1_000.0))
        .await
        .unwrap();
    (store, execution)
}

fn empty_input() -> GateDecisionInput {
    GateDecisionInput {
        coverage_score: 1.0,
        meets_threshold: true,
        gaps: Vec::new(),
        artifacts: vec!["requirements.md".to_string()],
    }
}

#[tokio::test]
async fn test_stale_task_machine_loses_race() {
    let (store, execution) = seeded_store().await;
    let task = TaskRecord::new(
        execution.execution_uuid,
        0,
        "requirements_analysis",
        AgentRoleId::from("requirements_analyst"),
        3,
    );
    store.insert_tasks(&[task.clone()]).await.unwrap();
    let publisher = Arc::new(EventPublisher::new(16));
    let none = DependencyStatuses::new();

    let mut first = TaskStateMachine::new(task.clone(), Arc::clone(&store), Arc::clone(&publisher));
    let mut second = TaskStateMachine::new(task.clone(), Arc::clone(&store), publisher);

    first.transition(TaskEvent::start(), &none).await.unwrap();
    let lost = second.transition(TaskEvent::start(), &none).await;
    assert!(matches!(
        lost,
        Err(StateMachineError::Persistence(StoreError::Conflict(_)))
    ));
    assert_eq!(second.current_state(), TaskStatus::Pending);

    let stored = store.get_task(task.task_uuid).await.unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.invocation_uuid, first.task().invocation_uuid);
}

#[tokio::test]
async fn test_stale_execution_machine_loses_race() {
    let (store, execution) = seeded_store().await;
    let publisher = Arc::new(EventPublisher::new(16));

    let mut runner = ExecutionStateMachine::new(
        execution.clone(),
        3,
        Arc::clone(&store),
        Arc::clone(&publisher),
    );
    let mut stale = ExecutionStateMachine::new(execution.clone(), 3, Arc::clone(&store), publisher);

    runner.transition(ExecutionEvent::Start).await.unwrap();
    let lost = stale.transition(ExecutionEvent::Cancel).await;
    assert!(matches!(
        lost,
        Err(StateMachineError::Persistence(StoreError::Conflict(_)))
    ));

    let reloaded = store.get_execution(execution.execution_uuid).await.unwrap();
    assert_eq!(reloaded.state.to_string(), "phase_1_running");
}

#[tokio::test]
async fn test_execution_history_is_ordered_and_linked() {
    let (store, execution) = seeded_store().await;
    let mut machine = ExecutionStateMachine::new(
        execution.clone(),
        2,
        Arc::clone(&store),
        Arc::new(EventPublisher::new(16)),
    );
    machine.transition(ExecutionEvent::Start).await.unwrap();
    machine.transition(ExecutionEvent::CompletePhase).await.unwrap();
    machine
        .transition(ExecutionEvent::AwaitGate("requirements_review".to_string()))
        .await
        .unwrap();

    let history = store
        .list_execution_transitions(execution.execution_uuid)
        .await
        .unwrap();
    let states: Vec<&str> = history.iter().map(|t| t.to_state.as_str()).collect();
    assert_eq!(
        states,
        vec![
            "initialized",
            "phase_1_running",
            "phase_1_complete",
            "waiting_requirements_review"
        ]
    );
    for pair in history.windows(2) {
        assert_eq!(pair[1].from_state.as_deref(), Some(pair[0].to_state.as_str()));
        assert!(pair[1].sort_key > pair[0].sort_key);
    }
}

#[tokio::test]
async fn test_transitions_publish_events_with_execution_context() {
    let (store, execution) = seeded_store().await;
    let publisher = Arc::new(EventPublisher::new(16));
    let mut receiver = publisher.subscribe();

    let task = TaskRecord::new(
        execution.execution_uuid,
        0,
        "requirements_analysis",
        AgentRoleId::from("requirements_analyst"),
        3,
    );
    store.insert_tasks(&[task.clone()]).await.unwrap();

    let mut execution_machine = ExecutionStateMachine::new(
        execution.clone(),
        1,
        Arc::clone(&store),
        Arc::clone(&publisher),
    );
    execution_machine.transition(ExecutionEvent::Start).await.unwrap();

    let mut task_machine = TaskStateMachine::new(task, Arc::clone(&store), publisher);
    task_machine
        .transition(TaskEvent::start(), &DependencyStatuses::new())
        .await
        .unwrap();

    let first = receiver.recv().await.unwrap();
    assert_eq!(first.name, events::EXECUTION_STATE_CHANGED);
    assert_eq!(first.execution_uuid(), Some(execution.execution_uuid));
    assert_eq!(first.context["to_state"], "phase_1_running");

    let second = receiver.recv().await.unwrap();
    assert_eq!(second.name, events::TASK_STATE_CHANGED);
    assert_eq!(second.execution_uuid(), Some(execution.execution_uuid));
    assert_eq!(second.context["to_state"], "running");
    assert_eq!(second.context["attempt"], 1);
}

#[tokio::test]
async fn test_gate_resolves_once() {
    let (store, execution) = seeded_store().await;
    let gate = Gate::new(execution.execution_uuid, 0, "requirements_review", 1, empty_input());
    store.insert_gate(&gate).await.unwrap();

    let mut approve = gate.clone();
    approve.resolution = GateResolution::Approved;
    approve.resolved_by = Some("alice".to_string());
    let mut reject = gate.clone();
    reject.resolution = GateResolution::Rejected;
    reject.resolved_by = Some("bob".to_string());

    let winner = store.resolve_gate(&approve).await.unwrap();
    assert!(matches!(winner, GateResolveOutcome::Resolved(_)));

    match store.resolve_gate(&reject).await.unwrap() {
        GateResolveOutcome::AlreadyResolved(stored) => {
            assert_eq!(stored.resolution, GateResolution::Approved);
            assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
        }
        other => panic!("expected AlreadyResolved, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_attempt_history_carries_error_metadata() {
    let (store, execution) = seeded_store().await;
    let task = TaskRecord::new(
        execution.execution_uuid,
        0,
        "requirements_analysis",
        AgentRoleId::from("requirements_analyst"),
        3,
    );
    store.insert_tasks(&[task.clone()]).await.unwrap();
    let none = DependencyStatuses::new();

    let publisher = Arc::new(EventPublisher::new(16));
    let mut machine = TaskStateMachine::new(task.clone(), Arc::clone(&store), publisher);
    machine.transition(TaskEvent::start(), &none).await.unwrap();
    machine
        .transition(TaskEvent::fail_with_error("connection reset"), &none)
        .await
        .unwrap();

    let history = store.list_task_transitions(task.task_uuid).await.unwrap();
    let failure = history.last().unwrap();
    assert_eq!(failure.event, "fail");
    assert_eq!(failure.from_state.as_deref(), Some("running"));
    assert_eq!(failure.to_state, "failed");
    assert_eq!(failure.metadata["attempt"], 1);
    assert!(failure.metadata["error"]
        .as_str()
        .is_some_and(|error| error.contains("connection reset")));
}
