//! Orchestrator harness and fixtures shared by the integration tests.

use conductor_core::config::ConductorConfig;
use conductor_core::database::{ExecutionStore, InMemoryStore};
use conductor_core::models::{BudgetCeilings, Cost, GateDecision};
use conductor_core::orchestration::{
    AgentWorker, GateResolutionRequest, GateResolutionResponse, Orchestrator, ProgressSnapshot,
    StartExecutionRequest,
};
use conductor_core::registry::{PipelineDefinition, RoleDefinition, RoleRegistry};
use conductor_core::state_machine::TaskStatus;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::mock_workers::ScriptedWorker;

/// Mandatory roles of the standard registry
pub const CORE_ROLES: [&str; 3] = [
    "requirements_analyst",
    "solution_architect",
    "backend_developer",
];

pub const WAIT: Duration = Duration::from_secs(5);

/// Defaults with millisecond backoff so retry tests run fast
pub fn test_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 50;
    config.retry.jitter_enabled = false;
    config.timeouts.standard = 5;
    config.timeouts.long_running = 5;
    config.timeouts.build = 5;
    config
}

pub fn ceilings(execution: f64, project: f64) -> BudgetCeilings {
    BudgetCeilings {
        execution: Cost::from_dollars(execution),
        project: Cost::from_dollars(project),
    }
}

/// Registry of non-mandatory roles, each estimated at ten cents
pub fn simple_registry(roles: &[&str]) -> RoleRegistry {
    let mut registry = RoleRegistry::new();
    for role in roles {
        registry
            .register(
                RoleDefinition::new(*role, *role).with_estimated_cost(Cost::from_dollars(0.10)),
            )
            .expect("unique role");
    }
    registry
}

pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ConductorConfig) -> Self {
        Self::with_definitions(
            config,
            RoleRegistry::standard(),
            PipelineDefinition::standard_delivery(),
        )
    }

    pub fn with_pipeline(pipeline: PipelineDefinition) -> Self {
        Self::with_definitions(test_config(), RoleRegistry::standard(), pipeline)
    }

    pub fn with_definitions(
        config: ConductorConfig,
        registry: RoleRegistry,
        pipeline: PipelineDefinition,
    ) -> Self {
        Self::on_store(Arc::new(InMemoryStore::new()), config, registry, pipeline)
    }

    /// A second orchestrator over an existing store, as after a restart
    pub fn on_store(
        store: Arc<InMemoryStore>,
        config: ConductorConfig,
        registry: RoleRegistry,
        pipeline: PipelineDefinition,
    ) -> Self {
        let dyn_store: Arc<dyn ExecutionStore> = store.clone();
        let orchestrator = Orchestrator::with_definitions(config, dyn_store, registry, pipeline)
            .expect("valid test definitions");
        Self {
            orchestrator,
            store,
        }
    }

    pub fn register(&self, role: &str, worker: Arc<dyn AgentWorker>) {
        self.orchestrator.register_worker(role, worker);
    }

    /// Register an always-succeeding worker for each role
    pub fn register_succeeding(&self, roles: &[&str]) {
        for role in roles {
            self.register(role, ScriptedWorker::succeeding(&format!("{role}.md"), 0.10));
        }
    }

    pub async fn start(&self, roles: &[&str]) -> Uuid {
        self.orchestrator
            .start(StartExecutionRequest::new(Uuid::new_v4(), roles.iter().copied()))
            .await
            .expect("execution starts")
    }

    pub async fn start_with_ceilings(&self, roles: &[&str], ceilings: BudgetCeilings) -> Uuid {
        self.orchestrator
            .start(
                StartExecutionRequest::new(Uuid::new_v4(), roles.iter().copied())
                    .with_ceilings(ceilings),
            )
            .await
            .expect("execution starts")
    }

    pub async fn wait_for_state(&self, execution_uuid: Uuid, state: &str) -> ProgressSnapshot {
        self.orchestrator
            .wait_for_state(execution_uuid, state, WAIT)
            .await
            .unwrap_or_else(|err| panic!("execution never reached {state}: {err}"))
    }

    pub async fn wait_for_task(
        &self,
        execution_uuid: Uuid,
        task_key: &str,
        status: TaskStatus,
    ) -> ProgressSnapshot {
        self.orchestrator
            .wait_for(execution_uuid, WAIT, |snapshot| {
                snapshot.task(task_key).is_some_and(|task| task.status == status)
            })
            .await
            .unwrap_or_else(|err| panic!("task {task_key} never reached {status}: {err}"))
    }

    pub async fn decide(
        &self,
        execution_uuid: Uuid,
        decision: GateDecision,
    ) -> GateResolutionResponse {
        self.orchestrator
            .resolve_gate(GateResolutionRequest::new(execution_uuid, decision).by("reviewer"))
            .await
            .expect("gate resolves")
    }
}
