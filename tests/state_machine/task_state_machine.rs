use conductor_core::database::{ExecutionStore, InMemoryStore};
use conductor_core::events::EventPublisher;
use conductor_core::models::{ChargeKey, ChargeOutcome, Cost, Execution, TaskRecord};
use conductor_core::registry::AgentRoleId;
use conductor_core::state_machine::{
    DependencyStatuses, StateMachineError, TaskEvent, TaskStateMachine, TaskStatus,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::ceilings;

struct Fixture {
    store: Arc<dyn ExecutionStore>,
    publisher: Arc<EventPublisher>,
    execution: Execution,
}

impl Fixture {
    async fn new(execution_ceiling: f64) -> Self {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
        let execution =
            Execution::new(Uuid::new_v4(), vec![AgentRoleId::from("backend_developer")]);
        store
            .create_execution(&execution, &ceilings(execution_ceiling, 1_000.0))
            .await
            .unwrap();
        Self {
            store,
            publisher: Arc::new(EventPublisher::new(128)),
            execution,
        }
    }

    async fn insert(&self, tasks: &[TaskRecord]) {
        self.store.insert_tasks(tasks).await.unwrap();
    }

    fn task(&self, key: &str) -> TaskRecord {
        TaskRecord::new(
            self.execution.execution_uuid,
            0,
            key,
            AgentRoleId::from("backend_developer"),
            3,
        )
    }

    fn machine(&self, task: TaskRecord) -> TaskStateMachine {
        TaskStateMachine::new(task, Arc::clone(&self.store), Arc::clone(&self.publisher))
    }
}

fn statuses(pairs: &[(Uuid, TaskStatus)]) -> DependencyStatuses {
    pairs.iter().copied().collect()
}

#[tokio::test]
async fn test_start_refused_until_dependencies_complete() {
    let fixture = Fixture::new(50.0).await;
    let upstream = fixture.task("schema");
    let downstream = fixture
        .task("api")
        .with_dependencies(vec![upstream.task_uuid]);
    fixture.insert(&[upstream.clone(), downstream.clone()]).await;

    let mut machine = fixture.machine(downstream.clone());
    let refused = machine
        .transition(
            TaskEvent::start(),
            &statuses(&[(upstream.task_uuid, TaskStatus::Running)]),
        )
        .await;
    assert!(matches!(refused, Err(StateMachineError::GuardFailed { .. })));
    assert_eq!(machine.current_state(), TaskStatus::Pending);

    let started = machine
        .transition(
            TaskEvent::start(),
            &statuses(&[(upstream.task_uuid, TaskStatus::Completed)]),
        )
        .await
        .unwrap();
    assert_eq!(started, TaskStatus::Running);
    assert_eq!(machine.task().attempts, 1);
}

#[tokio::test]
async fn test_skipped_dependency_does_not_satisfy_dependents() {
    let fixture = Fixture::new(50.0).await;
    let upstream = fixture.task("frontend").with_optional(true);
    let downstream = fixture
        .task("e2e")
        .with_dependencies(vec![upstream.task_uuid]);
    fixture.insert(&[upstream.clone(), downstream.clone()]).await;

    let mut machine = fixture.machine(downstream);
    let result = machine
        .transition(
            TaskEvent::start(),
            &statuses(&[(upstream.task_uuid, TaskStatus::Skipped)]),
        )
        .await;
    assert!(matches!(result, Err(StateMachineError::GuardFailed { .. })));
}

#[tokio::test]
async fn test_build_chain_walks_to_completion() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("backend_implementation");
    fixture.insert(&[task.clone()]).await;
    let none = DependencyStatuses::new();

    let mut machine = fixture.machine(task.clone());
    for (event, expected) in [
        (TaskEvent::start(), TaskStatus::Running),
        (TaskEvent::Deploy, TaskStatus::Deploying),
        (TaskEvent::RunTests, TaskStatus::Testing),
        (TaskEvent::TestsPassed, TaskStatus::Passed),
        (TaskEvent::Commit, TaskStatus::Committing),
        (
            TaskEvent::complete_with_artifact("git:abc123"),
            TaskStatus::Completed,
        ),
    ] {
        assert_eq!(machine.transition(event, &none).await.unwrap(), expected);
    }

    let stored = fixture.store.get_task(task.task_uuid).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.artifact.as_deref(), Some("git:abc123"));

    let events: Vec<String> = fixture
        .store
        .list_task_transitions(task.task_uuid)
        .await
        .unwrap()
        .into_iter()
        .map(|transition| transition.event)
        .collect();
    assert_eq!(
        events,
        vec!["create", "start", "deploy", "run_tests", "tests_passed", "commit", "complete"]
    );
}

#[tokio::test]
async fn test_stage_out_of_order_is_invalid() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("backend_implementation");
    fixture.insert(&[task.clone()]).await;
    let none = DependencyStatuses::new();

    let mut machine = fixture.machine(task);
    machine.transition(TaskEvent::start(), &none).await.unwrap();
    let result = machine.transition(TaskEvent::TestsPassed, &none).await;
    assert!(matches!(
        result,
        Err(StateMachineError::InvalidTransition { .. })
    ));
    assert_eq!(machine.current_state(), TaskStatus::Running);
}

#[tokio::test]
async fn test_exhaust_requires_spent_attempts() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("requirements_analysis");
    fixture.insert(&[task.clone()]).await;
    let none = DependencyStatuses::new();

    let mut machine = fixture.machine(task);
    machine.transition(TaskEvent::start(), &none).await.unwrap();
    machine
        .transition(TaskEvent::fail_with_error("timeout"), &none)
        .await
        .unwrap();
    let early = machine.transition(TaskEvent::Exhaust, &none).await;
    assert!(matches!(early, Err(StateMachineError::GuardFailed { .. })));

    for _ in 0..2 {
        machine.transition(TaskEvent::start(), &none).await.unwrap();
        machine
            .transition(TaskEvent::fail_with_error("timeout"), &none)
            .await
            .unwrap();
    }
    assert_eq!(machine.task().attempts, 3);

    let retry = machine.transition(TaskEvent::start(), &none).await;
    assert!(matches!(retry, Err(StateMachineError::GuardFailed { .. })));
    assert_eq!(
        machine.transition(TaskEvent::Exhaust, &none).await.unwrap(),
        TaskStatus::Blocked
    );
}

#[tokio::test]
async fn test_skip_only_for_optional_tasks() {
    let fixture = Fixture::new(50.0).await;
    let required = fixture.task("backend_implementation");
    let optional = fixture.task("documentation").with_optional(true);
    fixture.insert(&[required.clone(), optional.clone()]).await;
    let none = DependencyStatuses::new();

    let refused = fixture.machine(required).transition(TaskEvent::Skip, &none).await;
    assert!(matches!(refused, Err(StateMachineError::GuardFailed { .. })));

    let skipped = fixture
        .machine(optional)
        .transition(TaskEvent::Skip, &none)
        .await
        .unwrap();
    assert_eq!(skipped, TaskStatus::Skipped);
}

#[tokio::test]
async fn test_charged_completion_rejected_leaves_task_running() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("architecture_design");
    fixture.insert(&[task.clone()]).await;

    fixture
        .store
        .commit_charge(
            fixture.execution.execution_uuid,
            ChargeKey(Uuid::new_v4()),
            Cost::from_dollars(45.0),
        )
        .await
        .unwrap();

    let mut machine = fixture.machine(task.clone());
    machine
        .transition(TaskEvent::start(), &DependencyStatuses::new())
        .await
        .unwrap();
    let key = machine.task().charge_key().unwrap();

    let outcome = machine
        .transition_with_charge(
            TaskEvent::complete_with_artifact("adr.md"),
            key,
            Cost::from_dollars(12.0),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ChargeOutcome::Rejected { .. }));
    assert_eq!(machine.current_state(), TaskStatus::Running);

    let stored = fixture.store.get_task(task.task_uuid).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    let budget = fixture
        .store
        .budget_snapshot(fixture.execution.execution_uuid)
        .await
        .unwrap();
    assert_eq!(budget.execution.spent, Cost::from_dollars(45.0));
}

#[tokio::test]
async fn test_charged_completion_debits_once() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("architecture_design");
    fixture.insert(&[task.clone()]).await;

    let mut machine = fixture.machine(task.clone());
    machine
        .transition(TaskEvent::start(), &DependencyStatuses::new())
        .await
        .unwrap();
    let key = machine.task().charge_key().unwrap();

    let outcome = machine
        .transition_with_charge(
            TaskEvent::complete_with_artifact("adr.md"),
            key,
            Cost::from_dollars(4.0),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ChargeOutcome::Committed { .. }));
    assert_eq!(machine.task().cost, Cost::from_dollars(4.0));

    let replay = fixture
        .store
        .commit_charge(fixture.execution.execution_uuid, key, Cost::from_dollars(4.0))
        .await
        .unwrap();
    assert_eq!(replay, ChargeOutcome::AlreadyCommitted);
    let budget = fixture
        .store
        .budget_snapshot(fixture.execution.execution_uuid)
        .await
        .unwrap();
    assert_eq!(budget.execution.spent, Cost::from_dollars(4.0));
}

#[tokio::test]
async fn test_reset_returns_completed_task_to_pending() {
    let fixture = Fixture::new(50.0).await;
    let task = fixture.task("ux_design").with_optional(true);
    fixture.insert(&[task.clone()]).await;
    let none = DependencyStatuses::new();

    let mut machine = fixture.machine(task);
    machine.transition(TaskEvent::start(), &none).await.unwrap();
    machine
        .transition(TaskEvent::complete_with_artifact("flows.fig"), &none)
        .await
        .unwrap();
    assert_eq!(
        machine.transition(TaskEvent::Reset, &none).await.unwrap(),
        TaskStatus::Pending
    );
    assert_eq!(machine.task().attempts, 0);
    assert!(machine.task().artifact.is_none());
}
