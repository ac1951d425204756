//! # Orchestrator
//!
//! Public entry point. The orchestrator validates requests, owns the shared
//! components and routes every mutating operation to the runner that owns
//! the execution. Read-only queries (progress, budget, history) go straight
//! to the store and never touch a runner.
//!
//! Runners are started lazily: a command for an execution without a live
//! runner spawns one with the command preloaded, so operations on failed or
//! recovered executions behave the same as on running ones.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, instrument};
use uuid::Uuid;

use super::backoff_calculator::BackoffCalculator;
use super::budget_guard::BudgetGuard;
use super::errors::{OrchestrationError, OrchestrationResult};
use super::execution_runner::{ExecutionRunner, ExecutionRunnerHandle, RunnerCommand, RunnerContext};
use super::gate_manager::{GateManager, GateResolutionRequest};
use super::gateway::{AgentGateway, AgentWorker};
use super::progress::{ProgressAggregator, ProgressSnapshot};
use super::task_initializer::TaskInitializer;
use super::types::{GateResolutionResponse, StartExecutionRequest};
use crate::config::{ConductorConfig, ConfigManager};
use crate::database::{CeilingUpdate, ExecutionStore};
use crate::events::{EventPublisher, PublishedEvent};
use crate::error::Result as ConductorResult;
use crate::logging::{init_with_config, log_execution_operation};
use crate::models::{BudgetSnapshot, Execution, ExecutionTransition, TaskRecord, TaskTransition};
use crate::registry::{AgentRoleId, PipelineDefinition, RoleRegistry};
use crate::state_machine::ExecutionState;

/// A command is routed at most this many times before the runner is reported unavailable
const RUNNER_ATTEMPTS: usize = 2;

pub struct Orchestrator {
    ctx: RunnerContext,
    config: Arc<ConductorConfig>,
    progress: ProgressAggregator,
    runners: DashMap<Uuid, ExecutionRunnerHandle>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.ctx.pipeline.name)
            .field("runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator for the standard delivery pipeline and role registry
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn ExecutionStore>,
    ) -> OrchestrationResult<Self> {
        Self::with_definitions(
            config,
            store,
            RoleRegistry::standard(),
            PipelineDefinition::standard_delivery(),
        )
    }

    /// Load configuration from `config_dir` (default `config/`), initialize
    /// logging from its `logging` section and build the standard orchestrator
    pub fn bootstrap(
        config_dir: Option<PathBuf>,
        store: Arc<dyn ExecutionStore>,
    ) -> ConductorResult<Self> {
        let manager = ConfigManager::load_from_directory(config_dir)?;
        init_with_config(&manager.config().logging);
        info!(
            environment = manager.environment(),
            config_directory = %manager.config_directory().display(),
            "Bootstrapping orchestrator"
        );
        Ok(Self::new(manager.config().clone(), store)?)
    }

    pub fn with_definitions(
        config: ConductorConfig,
        store: Arc<dyn ExecutionStore>,
        registry: RoleRegistry,
        pipeline: PipelineDefinition,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        pipeline.validate(&registry)?;

        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let pipeline = Arc::new(pipeline);
        let event_publisher = Arc::new(EventPublisher::new(config.events.channel_capacity));

        let ctx = RunnerContext {
            budget_guard: BudgetGuard::new(Arc::clone(&store), Arc::clone(&event_publisher)),
            gate_manager: GateManager::new(
                Arc::clone(&store),
                Arc::clone(&event_publisher),
                config.execution.revision_policy,
            ),
            task_initializer: TaskInitializer::new(
                Arc::clone(&registry),
                Arc::clone(&pipeline),
                config.retry.max_attempts,
            ),
            backoff: BackoffCalculator::new(config.retry.backoff_config()),
            gateway: Arc::new(AgentGateway::new(config.timeouts.clone())),
            max_concurrent_tasks: config.execution.max_concurrent_tasks,
            command_buffer_size: config.execution.command_buffer_size,
            store: Arc::clone(&store),
            pipeline: Arc::clone(&pipeline),
            registry,
            event_publisher,
        };

        Ok(Self {
            progress: ProgressAggregator::new(store, pipeline),
            ctx,
            config,
            runners: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.ctx.registry
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.ctx.pipeline
    }

    pub fn gateway(&self) -> &AgentGateway {
        &self.ctx.gateway
    }

    pub fn event_publisher(&self) -> Arc<EventPublisher> {
        Arc::clone(&self.ctx.event_publisher)
    }

    /// Subscribe to lifecycle events of every execution
    pub fn events(&self) -> broadcast::Receiver<PublishedEvent> {
        self.ctx.event_publisher.subscribe()
    }

    pub fn register_worker(&self, role: impl Into<AgentRoleId>, worker: Arc<dyn AgentWorker>) {
        self.ctx.gateway.register_worker(role, worker);
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    /// Create an execution and start driving it
    #[instrument(skip(self, request), fields(project_uuid = %request.project_uuid))]
    pub async fn start(&self, request: StartExecutionRequest) -> OrchestrationResult<Uuid> {
        let roles = self.ctx.registry.validate_selection(&request.roles)?;

        let unserved: Vec<String> = roles
            .iter()
            .filter(|role| !self.ctx.gateway.has_worker(role))
            .map(ToString::to_string)
            .collect();
        if !unserved.is_empty() {
            return Err(OrchestrationError::InvalidSelection {
                reason: format!("no worker registered for roles {unserved:?}"),
            });
        }

        let execution = Execution::new(request.project_uuid, roles);
        let ceilings = request
            .ceilings
            .unwrap_or_else(|| self.config.budget.default_ceilings());
        self.ctx.store.create_execution(&execution, &ceilings).await?;

        log_execution_operation(
            "start",
            execution.execution_uuid,
            &execution.state.to_string(),
            Some(&format!(
                "{} roles, execution ceiling {}",
                execution.selected_roles.len(),
                ceilings.execution
            )),
        );

        if let Some((handle, command)) = self.route(execution.execution_uuid, RunnerCommand::Tick) {
            let _ = handle.send(command).await;
        }
        Ok(execution.execution_uuid)
    }

    /// Respawn runners for every unfinished execution found in the store
    #[instrument(skip(self))]
    pub async fn recover(&self) -> OrchestrationResult<Vec<Uuid>> {
        let executions = self.ctx.store.list_unfinished_executions().await?;
        let mut recovered = Vec::with_capacity(executions.len());
        for execution in executions {
            match self.route(execution.execution_uuid, RunnerCommand::Tick) {
                // Already owned by a live runner in this process
                Some(_) => {}
                None => recovered.push(execution.execution_uuid),
            }
        }
        info!(recovered = recovered.len(), "Recovered unfinished executions");
        Ok(recovered)
    }

    /// Stop every runner; persisted state is left for [`Orchestrator::recover`]
    pub async fn shutdown(&self) {
        let handles: Vec<ExecutionRunnerHandle> = self
            .runners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.runners.clear();

        for handle in &handles {
            let _ = handle.send(RunnerCommand::Shutdown).await;
        }
        for handle in &handles {
            handle.closed().await;
        }
        info!(runners = handles.len(), "Orchestrator shut down");
    }

    /// Whether a runner currently owns the execution
    pub fn is_running(&self, execution_uuid: Uuid) -> bool {
        self.runners
            .get(&execution_uuid)
            .is_some_and(|handle| !handle.is_closed())
    }

    // ----------------------------------------------------------------------
    // Commands
    // ----------------------------------------------------------------------

    #[instrument(skip(self, request), fields(execution_uuid = %request.execution_uuid))]
    pub async fn resolve_gate(
        &self,
        request: GateResolutionRequest,
    ) -> OrchestrationResult<GateResolutionResponse> {
        let execution_uuid = request.execution_uuid;
        let gate = self
            .request(execution_uuid, |respond_to| RunnerCommand::ResolveGate {
                request: request.clone(),
                respond_to,
            })
            .await?;
        let progress = self.progress(execution_uuid).await?;
        Ok(GateResolutionResponse { gate, progress })
    }

    /// Re-enter the current phase of a failed execution
    #[instrument(skip(self))]
    pub async fn retry(&self, execution_uuid: Uuid) -> OrchestrationResult<ExecutionState> {
        self.request(execution_uuid, |respond_to| RunnerCommand::Retry { respond_to })
            .await
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, execution_uuid: Uuid) -> OrchestrationResult<()> {
        self.request(execution_uuid, |respond_to| RunnerCommand::Pause { respond_to })
            .await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, execution_uuid: Uuid) -> OrchestrationResult<()> {
        self.request(execution_uuid, |respond_to| RunnerCommand::Resume { respond_to })
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_uuid: Uuid) -> OrchestrationResult<ExecutionState> {
        self.request(execution_uuid, |respond_to| RunnerCommand::Cancel { respond_to })
            .await
    }

    /// Mark a failed, blocked or pending task completed with an operator artifact
    #[instrument(skip(self, artifact))]
    pub async fn resolve_task_manually(
        &self,
        execution_uuid: Uuid,
        task_uuid: Uuid,
        artifact: Option<String>,
    ) -> OrchestrationResult<TaskRecord> {
        self.request(execution_uuid, |respond_to| RunnerCommand::ResolveTaskManually {
            task_uuid,
            artifact: artifact.clone(),
            respond_to,
        })
        .await
    }

    /// Skip an optional task
    #[instrument(skip(self))]
    pub async fn skip_task(
        &self,
        execution_uuid: Uuid,
        task_uuid: Uuid,
    ) -> OrchestrationResult<TaskRecord> {
        self.request(execution_uuid, |respond_to| RunnerCommand::SkipTask {
            task_uuid,
            respond_to,
        })
        .await
    }

    /// Change spend ceilings; a running execution re-evaluates afterwards
    #[instrument(skip(self))]
    pub async fn update_budget_ceilings(
        &self,
        execution_uuid: Uuid,
        update: CeilingUpdate,
    ) -> OrchestrationResult<BudgetSnapshot> {
        let snapshot = self
            .ctx
            .budget_guard
            .update_ceilings(execution_uuid, update)
            .await?;
        if self.is_running(execution_uuid) {
            if let Some((handle, command)) = self.route(execution_uuid, RunnerCommand::Tick) {
                let _ = handle.send(command).await;
            }
        }
        Ok(snapshot)
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    pub async fn progress(&self, execution_uuid: Uuid) -> OrchestrationResult<ProgressSnapshot> {
        self.progress.snapshot(execution_uuid).await
    }

    pub async fn budget(&self, execution_uuid: Uuid) -> OrchestrationResult<BudgetSnapshot> {
        self.ctx.budget_guard.snapshot(execution_uuid).await
    }

    pub async fn execution(&self, execution_uuid: Uuid) -> OrchestrationResult<Execution> {
        self.ctx
            .store
            .get_execution(execution_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)
    }

    pub async fn tasks(&self, execution_uuid: Uuid) -> OrchestrationResult<Vec<TaskRecord>> {
        self.execution(execution_uuid).await?;
        Ok(self.ctx.store.list_tasks(execution_uuid).await?)
    }

    pub async fn execution_history(
        &self,
        execution_uuid: Uuid,
    ) -> OrchestrationResult<Vec<ExecutionTransition>> {
        self.execution(execution_uuid).await?;
        Ok(self.ctx.store.list_execution_transitions(execution_uuid).await?)
    }

    pub async fn task_history(&self, task_uuid: Uuid) -> OrchestrationResult<Vec<TaskTransition>> {
        self.ctx
            .store
            .get_task(task_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)?;
        Ok(self.ctx.store.list_task_transitions(task_uuid).await?)
    }

    /// Replay the transition history to the state it ends in
    pub async fn reconstruct_state(
        &self,
        execution_uuid: Uuid,
    ) -> OrchestrationResult<ExecutionState> {
        let history = self.execution_history(execution_uuid).await?;
        match history.last() {
            None => Ok(ExecutionState::Initialized),
            Some(transition) => transition.to_state.parse().map_err(|reason: String| {
                OrchestrationError::Store(crate::database::StoreError::Serialization(reason))
            }),
        }
    }

    /// Wait until `predicate` holds for the execution's snapshot.
    ///
    /// Re-checks after every lifecycle event of the execution, so nothing
    /// polls the store on a timer.
    pub async fn wait_for<F>(
        &self,
        execution_uuid: Uuid,
        timeout: Duration,
        predicate: F,
    ) -> OrchestrationResult<ProgressSnapshot>
    where
        F: Fn(&ProgressSnapshot) -> bool,
    {
        let started = Instant::now();
        let mut events = self.ctx.event_publisher.subscribe();
        match tokio::time::timeout(
            timeout,
            self.wait_loop(execution_uuid, &mut events, &predicate),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::WaitTimeout {
                execution_uuid,
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Wait until the persisted state label equals `state`, e.g. `waiting_design_review`
    pub async fn wait_for_state(
        &self,
        execution_uuid: Uuid,
        state: &str,
        timeout: Duration,
    ) -> OrchestrationResult<ProgressSnapshot> {
        self.wait_for(execution_uuid, timeout, |snapshot| {
            snapshot.execution_state == state
        })
        .await
    }

    async fn wait_loop<F>(
        &self,
        execution_uuid: Uuid,
        events: &mut broadcast::Receiver<PublishedEvent>,
        predicate: &F,
    ) -> OrchestrationResult<ProgressSnapshot>
    where
        F: Fn(&ProgressSnapshot) -> bool,
    {
        loop {
            let snapshot = self.progress(execution_uuid).await?;
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.execution_uuid() == Some(execution_uuid) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(OrchestrationError::RunnerUnavailable(execution_uuid))
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------------------
    // Runner routing
    // ----------------------------------------------------------------------

    /// Send a command to the execution's runner and await its reply
    async fn request<T>(
        &self,
        execution_uuid: Uuid,
        build: impl Fn(oneshot::Sender<OrchestrationResult<T>>) -> RunnerCommand,
    ) -> OrchestrationResult<T> {
        // Fail fast on unknown executions instead of spawning a runner for them
        self.execution(execution_uuid).await?;

        for _ in 0..RUNNER_ATTEMPTS {
            let (respond_to, response) = oneshot::channel();
            if let Some((handle, command)) = self.route(execution_uuid, build(respond_to)) {
                if handle.send(command).await.is_err() {
                    continue;
                }
            }
            // A dropped responder means the runner exited before handling the command
            if let Ok(result) = response.await {
                return result;
            }
        }
        Err(OrchestrationError::RunnerUnavailable(execution_uuid))
    }

    /// Hand `command` to the live runner, or spawn one with it preloaded.
    ///
    /// Returns the handle and command when the caller still has to send it.
    fn route(
        &self,
        execution_uuid: Uuid,
        command: RunnerCommand,
    ) -> Option<(ExecutionRunnerHandle, RunnerCommand)> {
        match self.runners.entry(execution_uuid) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                Some((entry.get().clone(), command))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(ExecutionRunner::spawn(
                    self.ctx.clone(),
                    execution_uuid,
                    Some(command),
                ));
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(ExecutionRunner::spawn(
                    self.ctx.clone(),
                    execution_uuid,
                    Some(command),
                ));
                None
            }
        }
    }
}
