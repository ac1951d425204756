//! End-to-end walks through the pipeline with scripted agents.

use conductor_core::database::CeilingUpdate;
use conductor_core::models::{BudgetScope, Cost, FailureReason, GateDecision, GateResolution};
use conductor_core::orchestration::{AgentError, ExecutionStatus, GateResolutionRequest};
use conductor_core::registry::{PhaseDefinition, PipelineDefinition, TaskTemplate};
use conductor_core::state_machine::{ExecutionState, TaskStatus};

use crate::common::{
    ceilings, simple_registry, test_config, BlockingWorker, ScriptedWorker, TestHarness,
    CORE_ROLES, WAIT,
};

fn discovery_pipeline() -> PipelineDefinition {
    PipelineDefinition::new(
        "discovery_then_delivery",
        vec![
            PhaseDefinition::new(
                "discovery",
                0.4,
                vec![
                    TaskTemplate::new("market_scan", "analyst"),
                    TaskTemplate::new("user_interviews", "researcher"),
                    TaskTemplate::new("tech_survey", "architect"),
                ],
            ),
            PhaseDefinition::new(
                "delivery",
                0.6,
                vec![TaskTemplate::new("prototype", "builder")],
            ),
        ],
    )
}

#[tokio::test]
async fn test_independent_tasks_run_in_parallel_without_gates() {
    let roles = ["analyst", "researcher", "architect", "builder"];
    let harness = TestHarness::with_definitions(
        test_config(),
        simple_registry(&roles),
        discovery_pipeline(),
    );
    let blockers = [
        BlockingWorker::new("market.md", 0.2),
        BlockingWorker::new("interviews.md", 0.2),
        BlockingWorker::new("survey.md", 0.2),
    ];
    for (role, worker) in roles.iter().zip(blockers.iter()) {
        harness.register(role, worker.clone());
    }
    harness.register("builder", ScriptedWorker::succeeding("prototype.zip", 1.0));

    let execution_uuid = harness.start(&roles).await;

    // All three phase-1 tasks are in flight at once
    harness
        .orchestrator
        .wait_for(execution_uuid, WAIT, |snapshot| {
            ["market_scan", "user_interviews", "tech_survey"]
                .iter()
                .all(|key| snapshot.task(key).is_some_and(|t| t.status == TaskStatus::Running))
        })
        .await
        .unwrap();
    for worker in &blockers {
        assert_eq!(worker.calls(), 1);
        worker.release();
    }

    let done = harness.wait_for_state(execution_uuid, "completed").await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!((done.overall_progress - 100.0).abs() < f64::EPSILON);

    let history = harness
        .orchestrator
        .execution_history(execution_uuid)
        .await
        .unwrap();
    let states: Vec<&str> = history.iter().map(|t| t.to_state.as_str()).collect();
    assert!(states.iter().all(|state| !state.starts_with("waiting_")));
    let complete_at = states.iter().position(|s| *s == "phase_1_complete").unwrap();
    assert_eq!(states[complete_at + 1], "phase_2_running");
    assert_eq!(states.last(), Some(&"completed"));
}

#[tokio::test]
async fn test_execution_holds_at_requirements_gate() {
    let harness = TestHarness::new();
    harness.register_succeeding(&CORE_ROLES);

    let execution_uuid = harness.start(&CORE_ROLES).await;
    let waiting = harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;

    assert_eq!(waiting.status, ExecutionStatus::Waiting);
    assert!((waiting.overall_progress - 20.0).abs() < 0.001);
    let gate = waiting.pending_gate.expect("pending gate");
    assert_eq!(gate.name, "requirements_review");
    assert_eq!(gate.round, 1);
    assert!(gate.meets_threshold);

    // Nothing moves without a decision
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let later = harness.orchestrator.progress(execution_uuid).await.unwrap();
    assert_eq!(later.execution_state, "waiting_requirements_review");
    assert!(later.tasks.iter().all(|task| task.phase == 1));
    assert_eq!(
        harness.orchestrator.reconstruct_state(execution_uuid).await.unwrap(),
        ExecutionState::Waiting {
            gate: "requirements_review".to_string()
        }
    );
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let harness = TestHarness::new();
    let analyst = ScriptedWorker::failing_then_succeeding(
        vec![
            AgentError::Network("connection reset".to_string()),
            AgentError::Network("connection reset".to_string()),
        ],
        "requirements.md",
        0.4,
    );
    harness.register("requirements_analyst", analyst.clone());
    harness.register_succeeding(&["solution_architect", "backend_developer"]);

    let execution_uuid = harness.start(&CORE_ROLES).await;
    let waiting = harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;

    let task = waiting.task("requirements_analysis").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.artifact.as_deref(), Some("requirements.md"));
    assert_eq!(analyst.calls(), 3);

    let history = harness
        .orchestrator
        .task_history(task.task_uuid)
        .await
        .unwrap();
    let failures = history.iter().filter(|t| t.event == "fail").count();
    assert_eq!(failures, 2);

    let attempts: Vec<u32> = analyst.requests().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_budget_exhaustion_then_raise_and_retry() {
    let harness = TestHarness::new();
    let analyst = ScriptedWorker::succeeding("requirements.md", 45.0);
    let architect = ScriptedWorker::succeeding("architecture.md", 12.0);
    harness.register("requirements_analyst", analyst.clone());
    harness.register("solution_architect", architect.clone());
    harness.register_succeeding(&["backend_developer"]);

    let execution_uuid = harness
        .start_with_ceilings(&CORE_ROLES, ceilings(50.0, 1_000.0))
        .await;
    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;
    harness.decide(execution_uuid, GateDecision::Approve).await;

    let failed = harness.wait_for_state(execution_uuid, "failed").await;
    match failed.failure {
        Some(FailureReason::BudgetExceeded {
            scope,
            attempted,
            spent,
            ceiling,
            ..
        }) => {
            assert_eq!(scope, BudgetScope::Execution);
            assert_eq!(attempted, Cost::from_dollars(12.0));
            assert_eq!(spent, Cost::from_dollars(45.0));
            assert_eq!(ceiling, Cost::from_dollars(50.0));
        }
        other => panic!("expected budget failure, got {other:?}"),
    }
    let design = failed.task("architecture_design").unwrap();
    assert_eq!(design.status, TaskStatus::Failed);
    assert!(design
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("budget exceeded")));

    let budget = harness.orchestrator.budget(execution_uuid).await.unwrap();
    assert_eq!(budget.execution.spent, Cost::from_dollars(45.0));
    assert_eq!(budget.execution.reserved, Cost::ZERO);

    harness
        .orchestrator
        .update_budget_ceilings(
            execution_uuid,
            CeilingUpdate {
                execution: Some(Cost::from_dollars(100.0)),
                project: None,
            },
        )
        .await
        .unwrap();
    let resumed = harness.orchestrator.retry(execution_uuid).await.unwrap();
    assert_eq!(resumed, ExecutionState::PhaseRunning(1));

    harness
        .wait_for_state(execution_uuid, "waiting_design_review")
        .await;
    assert_eq!(analyst.calls(), 1);
    assert_eq!(architect.calls(), 2);
    let budget = harness.orchestrator.budget(execution_uuid).await.unwrap();
    assert_eq!(budget.execution.spent, Cost::from_dollars(57.0));
}

#[tokio::test]
async fn test_targeted_revision_reruns_only_flagged_task() {
    let harness = TestHarness::new();
    let architect = ScriptedWorker::succeeding("architecture.md", 1.0);
    let designer = ScriptedWorker::succeeding("flows.fig", 0.5);
    harness.register("solution_architect", architect.clone());
    harness.register("ux_designer", designer.clone());
    harness.register_succeeding(&["requirements_analyst", "backend_developer"]);

    let mut roles = CORE_ROLES.to_vec();
    roles.push("ux_designer");
    let execution_uuid = harness.start(&roles).await;

    harness
        .wait_for_state(execution_uuid, "waiting_requirements_review")
        .await;
    harness.decide(execution_uuid, GateDecision::Approve).await;
    harness
        .wait_for_state(execution_uuid, "waiting_design_review")
        .await;

    let response = harness
        .orchestrator
        .resolve_gate(
            GateResolutionRequest::revise(execution_uuid, ["ux_design"])
                .with_notes("Add an onboarding flow")
                .by("reviewer"),
        )
        .await
        .unwrap();
    assert_eq!(response.gate.resolution, GateResolution::RevisionRequested);
    assert_eq!(response.gate.round, 1);

    let second_round = harness
        .orchestrator
        .wait_for(execution_uuid, WAIT, |snapshot| {
            snapshot
                .pending_gate
                .as_ref()
                .is_some_and(|gate| gate.name == "design_review" && gate.round == 2)
        })
        .await
        .unwrap();
    assert_eq!(second_round.execution_state, "waiting_design_review");

    assert_eq!(architect.calls(), 1);
    assert_eq!(designer.calls(), 2);
    let requests = designer.requests();
    assert_eq!(requests[0].revision_notes, None);
    assert_eq!(
        requests[1].revision_notes.as_deref(),
        Some("Add an onboarding flow")
    );
    assert_eq!(
        requests[1].inputs.get("requirements_analysis").map(String::as_str),
        Some("requirements_analyst.md")
    );
}
