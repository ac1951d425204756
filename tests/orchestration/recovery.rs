use conductor_core::constants::system;
use conductor_core::models::{Cost, GateDecision};
use conductor_core::registry::{PipelineDefinition, RoleRegistry};
use conductor_core::state_machine::TaskStatus;

use crate::common::{test_config, BlockingWorker, TestHarness, CORE_ROLES};

fn restarted(previous: &TestHarness) -> TestHarness {
    TestHarness::on_store(
        previous.store.clone(),
        test_config(),
        RoleRegistry::standard(),
        PipelineDefinition::standard_delivery(),
    )
}

#[tokio::test]
async fn test_recover_reconciles_orphaned_invocation() {
    let first = TestHarness::new();
    let analyst = BlockingWorker::new("requirements.md", 0.5);
    first.register("requirements_analyst", analyst.clone());
    first.register_succeeding(&["solution_architect", "backend_developer"]);

    let execution_uuid = first.start(&CORE_ROLES).await;
    first
        .wait_for_task(execution_uuid, "requirements_analysis", TaskStatus::Running)
        .await;
    let held = first.orchestrator.budget(execution_uuid).await.unwrap();
    assert!(held.execution.reserved > Cost::ZERO);

    first.orchestrator.shutdown().await;
    assert!(!first.orchestrator.is_running(execution_uuid));

    let second = restarted(&first);
    second.register_succeeding(&CORE_ROLES);
    let recovered = second.orchestrator.recover().await.unwrap();
    assert_eq!(recovered, vec![execution_uuid]);

    let waiting = second
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;
    let task = waiting.task("requirements_analysis").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
    assert_eq!(analyst.calls(), 1);

    let history = second
        .orchestrator
        .task_history(task.task_uuid)
        .await
        .unwrap();
    let orphaned = history
        .iter()
        .find(|transition| transition.event == "fail")
        .expect("orphan reconciled as a failure");
    assert_eq!(
        orphaned.metadata["error"],
        serde_json::json!(system::ORPHANED_INVOCATION_REASON)
    );

    let budget = second.orchestrator.budget(execution_uuid).await.unwrap();
    assert_eq!(budget.execution.reserved, Cost::ZERO);
    assert_eq!(budget.execution.spent, Cost::from_dollars(0.10));

    let execution = second.orchestrator.execution(execution_uuid).await.unwrap();
    assert_eq!(
        second
            .orchestrator
            .reconstruct_state(execution_uuid)
            .await
            .unwrap(),
        execution.state
    );
}

#[tokio::test]
async fn test_recover_skips_live_and_finished_executions() {
    let harness = TestHarness::new();
    harness.register_succeeding(&CORE_ROLES);

    let waiting = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_state(waiting, "waiting_requirements_review")
        .await;

    let rejected = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_state(rejected, "waiting_requirements_review")
        .await;
    harness.decide(rejected, GateDecision::Reject).await;

    // The waiting execution is still owned by its runner
    assert!(harness.orchestrator.recover().await.unwrap().is_empty());

    harness.orchestrator.shutdown().await;
    let second = restarted(&harness);
    second.register_succeeding(&CORE_ROLES);
    assert_eq!(second.orchestrator.recover().await.unwrap(), vec![waiting]);
}

#[tokio::test]
async fn test_commands_after_shutdown_respawn_runner() {
    let harness = TestHarness::new();
    harness.register_succeeding(&CORE_ROLES);
    let execution_uuid = harness.start(&CORE_ROLES).await;
    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;

    harness.orchestrator.shutdown().await;
    assert!(!harness.orchestrator.is_running(execution_uuid));

    harness.decide(execution_uuid, GateDecision::Approve).await;
    assert!(harness.orchestrator.is_running(execution_uuid));
    harness
        .wait_for_state(execution_uuid, "waiting_design_review")
        .await;
}
