use conductor_core::constants::events;
use conductor_core::database::{CeilingUpdate, StoreError};
use conductor_core::models::{BudgetScope, Cost, FailureReason};
use conductor_core::orchestration::{OrchestrationError, StartExecutionRequest};
use conductor_core::state_machine::TaskStatus;
use uuid::Uuid;

use crate::common::{ceilings, ScriptedWorker, TestHarness, CORE_ROLES, WAIT};

#[tokio::test]
async fn test_reservation_over_ceiling_fails_before_dispatch() {
    let harness = TestHarness::new();
    let analyst = ScriptedWorker::succeeding("requirements.md", 0.1);
    harness.register("requirements_analyst", analyst.clone());
    harness.register_succeeding(&["solution_architect", "backend_developer"]);

    // Requirements analyst is estimated at $0.50
    let execution_uuid = harness
        .start_with_ceilings(&CORE_ROLES, ceilings(0.25, 100.0))
        .await;
    let failed = harness.wait_for_state(execution_uuid, "failed").await;

    match failed.failure {
        Some(FailureReason::BudgetExceeded {
            scope,
            task_uuid,
            attempted,
            ..
        }) => {
            assert_eq!(scope, BudgetScope::Execution);
            assert_eq!(attempted, Cost::from_dollars(0.5));
            assert_eq!(
                task_uuid,
                failed.task("requirements_analysis").map(|t| t.task_uuid)
            );
        }
        other => panic!("expected budget failure, got {other:?}"),
    }
    assert_eq!(analyst.calls(), 0);
    assert_eq!(
        failed.task("requirements_analysis").unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_project_ceiling_shared_across_executions() {
    let harness = TestHarness::new();
    harness.register("requirements_analyst", ScriptedWorker::succeeding("requirements.md", 8.0));
    harness.register_succeeding(&["solution_architect", "backend_developer"]);
    let project_uuid = Uuid::new_v4();

    let first = harness
        .orchestrator
        .start(
            StartExecutionRequest::new(project_uuid, CORE_ROLES)
                .with_ceilings(ceilings(50.0, 10.0)),
        )
        .await
        .unwrap();
    harness
        .wait_for_state(first, "waiting_requirements_review")
        .await;

    let second = harness
        .orchestrator
        .start(
            StartExecutionRequest::new(project_uuid, CORE_ROLES)
                .with_ceilings(ceilings(50.0, 10.0)),
        )
        .await
        .unwrap();
    let failed = harness.wait_for_state(second, "failed").await;
    assert!(matches!(
        failed.failure,
        Some(FailureReason::BudgetExceeded {
            scope: BudgetScope::Project,
            ..
        })
    ));

    let budget = harness.orchestrator.budget(second).await.unwrap();
    assert_eq!(budget.project.spent, Cost::from_dollars(8.0));
    assert_eq!(budget.execution.spent, Cost::ZERO);
    assert_eq!(budget.project.reserved, Cost::ZERO);
}

#[tokio::test]
async fn test_ceiling_cannot_drop_below_spend() {
    let harness = TestHarness::new();
    harness.register("requirements_analyst", ScriptedWorker::succeeding("requirements.md", 5.0));
    harness.register_succeeding(&["solution_architect", "backend_developer"]);
    let execution_uuid = harness
        .start_with_ceilings(&CORE_ROLES, ceilings(20.0, 100.0))
        .await;
    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;

    let error = harness
        .orchestrator
        .update_budget_ceilings(
            execution_uuid,
            CeilingUpdate {
                execution: Some(Cost::from_dollars(4.0)),
                project: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        OrchestrationError::Store(StoreError::Conflict(_))
    ));

    let lowered = harness
        .orchestrator
        .update_budget_ceilings(
            execution_uuid,
            CeilingUpdate {
                execution: Some(Cost::from_dollars(6.0)),
                project: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(lowered.execution.ceiling, Cost::from_dollars(6.0));
    assert_eq!(lowered.project.ceiling, Cost::from_dollars(100.0));
}

#[tokio::test]
async fn test_successful_charges_are_published() {
    let harness = TestHarness::new();
    harness.register("requirements_analyst", ScriptedWorker::succeeding("requirements.md", 2.0));
    harness.register_succeeding(&["solution_architect", "backend_developer"]);
    let mut receiver = harness.orchestrator.events();

    let execution_uuid = harness.start(&CORE_ROLES).await;
    let committed = tokio::time::timeout(WAIT, async {
        loop {
            let event = receiver.recv().await.unwrap();
            if event.name == events::BUDGET_COMMITTED {
                return event;
            }
        }
    })
    .await
    .expect("charge event published");

    assert_eq!(committed.execution_uuid(), Some(execution_uuid));
    assert_eq!(
        committed.context["amount"],
        serde_json::to_value(Cost::from_dollars(2.0)).unwrap()
    );
}

#[tokio::test]
async fn test_unknown_execution_budget_lookup() {
    let harness = TestHarness::new();
    let missing = Uuid::new_v4();
    let error = harness.orchestrator.budget(missing).await.unwrap_err();
    assert_eq!(error, OrchestrationError::ExecutionNotFound(missing));
}
