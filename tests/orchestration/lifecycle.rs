use conductor_core::constants::events;
use conductor_core::models::{Cost, GateDecision};
use conductor_core::orchestration::{ExecutionStatus, OrchestrationError, StartExecutionRequest};
use conductor_core::registry::{PhaseDefinition, PipelineDefinition, TaskTemplate};
use conductor_core::state_machine::{ExecutionState, TaskStatus};
use std::time::Duration;
use uuid::Uuid;

use crate::common::{
    simple_registry, test_config, BlockingWorker, DelayedWorker, ScriptedWorker, TestHarness,
    CORE_ROLES,
};

fn draft_then_edit() -> PipelineDefinition {
    PipelineDefinition::new(
        "draft_then_edit",
        vec![PhaseDefinition::new(
            "writing",
            1.0,
            vec![
                TaskTemplate::new("draft", "drafter"),
                TaskTemplate::new("edit", "editor").depends_on(["draft"]),
            ],
        )],
    )
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let roles = ["drafter", "editor"];
    let harness =
        TestHarness::with_definitions(test_config(), simple_registry(&roles), draft_then_edit());
    let drafter = BlockingWorker::new("draft.md", 0.2);
    let editor = ScriptedWorker::succeeding("edited.md", 0.2);
    harness.register("drafter", drafter.clone());
    harness.register("editor", editor.clone());
    let mut receiver = harness.orchestrator.events();

    let execution_uuid = harness.start(&roles).await;
    harness
        .wait_for_task(execution_uuid, "draft", TaskStatus::Running)
        .await;

    harness.orchestrator.pause(execution_uuid).await.unwrap();
    harness.orchestrator.pause(execution_uuid).await.unwrap();
    let paused = harness.orchestrator.progress(execution_uuid).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.execution_state, "phase_1_running");

    // The in-flight draft still lands while paused
    drafter.release();
    harness
        .wait_for_task(execution_uuid, "draft", TaskStatus::Completed)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let held = harness.orchestrator.progress(execution_uuid).await.unwrap();
    assert_eq!(held.task("edit").unwrap().status, TaskStatus::Pending);
    assert_eq!(editor.calls(), 0);

    harness.orchestrator.resume(execution_uuid).await.unwrap();
    harness.wait_for_state(execution_uuid, "completed").await;
    assert_eq!(editor.calls(), 1);

    let mut names = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if event.execution_uuid() == Some(execution_uuid) {
            names.push(event.name);
        }
    }
    assert_eq!(
        names.iter().filter(|n| *n == events::EXECUTION_PAUSED).count(),
        1
    );
    assert_eq!(
        names.iter().filter(|n| *n == events::EXECUTION_RESUMED).count(),
        1
    );
}

#[tokio::test]
async fn test_cancel_signals_in_flight_work() {
    let harness = TestHarness::new();
    let analyst = BlockingWorker::new("requirements.md", 0.5);
    harness.register("requirements_analyst", analyst.clone());
    harness.register_succeeding(&["solution_architect", "backend_developer"]);

    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Running)
        .await;

    let state = harness.orchestrator.cancel(execution_uuid).await.unwrap();
    assert_eq!(state, ExecutionState::Cancelled);

    let settled = harness
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Failed)
        .await;
    assert_eq!(settled.status, ExecutionStatus::Cancelled);
    let budget = harness.orchestrator.budget(execution_uuid).await.unwrap();
    assert_eq!(budget.execution.reserved, Cost::ZERO);
    assert_eq!(budget.execution.spent, Cost::ZERO);

    let again = harness.orchestrator.cancel(execution_uuid).await.unwrap_err();
    assert!(matches!(again, OrchestrationError::ExecutionTerminal { .. }));
    let pause = harness.orchestrator.pause(execution_uuid).await.unwrap_err();
    assert!(matches!(pause, OrchestrationError::ExecutionTerminal { .. }));
}

#[tokio::test]
async fn test_cancelled_execution_charges_late_success() {
    let harness = TestHarness::new();
    let analyst = DelayedWorker::new(Duration::from_millis(200), "requirements.md", 5.0);
    harness.register("requirements_analyst", analyst.clone());
    harness.register_succeeding(&["solution_architect", "backend_developer"]);

    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Running)
        .await;

    let state = harness.orchestrator.cancel(execution_uuid).await.unwrap();
    assert_eq!(state, ExecutionState::Cancelled);

    // The agent was already working; its result lands and is paid for
    let settled = harness
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Completed)
        .await;
    assert_eq!(settled.status, ExecutionStatus::Cancelled);
    assert_eq!(settled.execution_state, "cancelled");
    let task = settled.task("requirements_analysis").unwrap();
    assert_eq!(task.artifact.as_deref(), Some("requirements.md"));
    assert_eq!(analyst.calls(), 1);

    let budget = harness.orchestrator.budget(execution_uuid).await.unwrap();
    assert_eq!(budget.execution.spent, Cost::from_dollars(5.0));
    assert_eq!(budget.execution.reserved, Cost::ZERO);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = harness.orchestrator.progress(execution_uuid).await.unwrap();
    assert_eq!(after.execution_state, "cancelled");
    assert_eq!(after.pending_gate, None);
}

#[tokio::test]
async fn test_build_task_walks_build_stages() {
    let harness = TestHarness::new();
    harness.register(
        "backend_developer",
        ScriptedWorker::building("git:4f2a9c1", 2.5, "all 42 tests green"),
    );
    harness.register_succeeding(&["requirements_analyst", "solution_architect"]);

    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;
    harness.decide(execution_uuid, GateDecision::Approve).await;
    harness
        .wait_for_state(execution_uuid, "waiting_design_review")
        .await;
    harness.decide(execution_uuid, GateDecision::Approve).await;
    let done = harness.wait_for_state(execution_uuid, "completed").await;

    let backend = done.task("backend_implementation").unwrap();
    assert_eq!(backend.status, TaskStatus::Completed);
    assert_eq!(backend.artifact.as_deref(), Some("git:4f2a9c1"));
    assert_eq!(backend.last_message.as_deref(), Some("all 42 tests green"));

    let events: Vec<String> = harness
        .orchestrator
        .task_history(backend.task_uuid)
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
async fn test_start_rejects_invalid_selection() {
    let harness = TestHarness::new();
    harness.register_succeeding(&CORE_ROLES);

    let missing_mandatory = harness
        .orchestrator
        .start(StartExecutionRequest::new(
            Uuid::new_v4(),
            ["requirements_analyst", "solution_architect"],
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        missing_mandatory,
        OrchestrationError::InvalidSelection { ref reason } if reason.contains("backend_developer")
    ));

    let unknown = harness
        .orchestrator
        .start(StartExecutionRequest::new(
            Uuid::new_v4(),
            ["requirements_analyst", "solution_architect", "backend_developer", "astrologer"],
        ))
        .await
        .unwrap_err();
    assert!(matches!(unknown, OrchestrationError::InvalidSelection { .. }));

    let mut roles = CORE_ROLES.to_vec();
    roles.push("qa_engineer");
    let unserved = harness
        .orchestrator
        .start(StartExecutionRequest::new(Uuid::new_v4(), roles))
        .await
        .unwrap_err();
    assert!(matches!(
        unserved,
        OrchestrationError::InvalidSelection { ref reason } if reason.contains("qa_engineer")
    ));
}

#[tokio::test]
async fn test_commands_on_unknown_or_running_execution() {
    let harness = TestHarness::new();
    let analyst = BlockingWorker::new("requirements.md", 0.5);
    harness.register("requirements_analyst", analyst.clone());
    harness.register_succeeding(&["solution_architect", "backend_developer"]);

    let missing = Uuid::new_v4();
    assert_eq!(
        harness.orchestrator.retry(missing).await.unwrap_err(),
        OrchestrationError::ExecutionNotFound(missing)
    );
    assert_eq!(
        harness.orchestrator.progress(missing).await.unwrap_err(),
        OrchestrationError::ExecutionNotFound(missing)
    );
    assert!(!harness.orchestrator.is_running(missing));

    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Running)
        .await;
    assert!(harness.orchestrator.is_running(execution_uuid));
    assert!(matches!(
        harness.orchestrator.retry(execution_uuid).await.unwrap_err(),
        OrchestrationError::NotRetryable { ref state, .. } if state == "phase_1_running"
    ));

    let timeout = harness
        .orchestrator
        .wait_for_state(execution_uuid, "completed", Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(timeout, OrchestrationError::WaitTimeout { .. }));
    analyst.release();
}

#[tokio::test]
async fn test_progress_is_recorded_on_the_execution() {
    let harness = TestHarness::new();
    harness.register_succeeding(&CORE_ROLES);
    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;

    let execution = harness.orchestrator.execution(execution_uuid).await.unwrap();
    assert!((execution.progress - 20.0).abs() < 0.01);
    assert_eq!(execution.current_phase, 0);
}
