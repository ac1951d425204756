//! # Execution Runner
//!
//! One actor per live execution. The runner is the only writer of its
//! execution's state: external operations arrive as [`RunnerCommand`]s on a
//! bounded mailbox and are applied one at a time, interleaved with agent
//! results and build-stage reports. Nothing else mutates the execution while
//! it runs, so gate decisions, retries and completions can never race.
//!
//! ```text
//!   commands ─┐
//!   results ──┼──▶ ExecutionRunner ──▶ state machines ──▶ ExecutionStore
//!   stages ───┤          │
//!   backoff ──┘          └──▶ AgentGateway (JoinSet of invocations)
//! ```
//!
//! Every loop iteration ends with [`ExecutionRunner::drive`], which re-reads
//! persisted task records and advances the execution as far as it can:
//! instantiating phase tasks, blocking unreachable work, dispatching ready
//! tasks, closing phases and opening gates. Because all decisions come from
//! the store, a restarted runner continues exactly where the last one stopped.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff_calculator::BackoffCalculator;
use super::budget_guard::BudgetGuard;
use super::errors::{OrchestrationError, OrchestrationResult};
use super::gate_manager::{GateManager, GateResolutionRequest};
use super::gateway::{
    AgentGateway, AgentRequest, InvocationContext, InvocationOutcome, StageReporter, StageUpdate,
    StageUpdateKind,
};
use super::progress::ProgressAggregator;
use super::task_graph::{PhaseCompletion, TaskGraph};
use super::task_initializer::TaskInitializer;
use crate::constants::{events as event_names, system};
use crate::database::{ExecutionStore, StoreError};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_execution_operation, log_task_operation};
use crate::models::{ChargeKey, Execution, FailureReason, Gate, GateResolution, TaskRecord};
use crate::registry::{PipelineDefinition, RoleRegistry};
use crate::state_machine::{
    DependencyStatuses, ExecutionEvent, ExecutionState, ExecutionStateMachine, StateMachineError,
    TaskEvent, TaskStateMachine, TaskStatus,
};

/// Upper bound on state advances per drive pass
const MAX_DRIVE_STEPS: usize = 64;

type Responder<T> = oneshot::Sender<OrchestrationResult<T>>;

/// Operations applied by a runner on behalf of the orchestrator
#[derive(Debug)]
pub enum RunnerCommand {
    /// Re-evaluate the execution
    Tick,
    ResolveGate {
        request: GateResolutionRequest,
        respond_to: Responder<Gate>,
    },
    Retry {
        respond_to: Responder<ExecutionState>,
    },
    Pause {
        respond_to: Responder<()>,
    },
    Resume {
        respond_to: Responder<()>,
    },
    Cancel {
        respond_to: Responder<ExecutionState>,
    },
    ResolveTaskManually {
        task_uuid: Uuid,
        artifact: Option<String>,
        respond_to: Responder<TaskRecord>,
    },
    SkipTask {
        task_uuid: Uuid,
        respond_to: Responder<TaskRecord>,
    },
    /// Stop without touching persisted state; in-flight work is reconciled on restart
    Shutdown,
}

/// Dependencies shared by all runners of one orchestrator
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn ExecutionStore>,
    pub pipeline: Arc<PipelineDefinition>,
    pub registry: Arc<RoleRegistry>,
    pub gateway: Arc<AgentGateway>,
    pub event_publisher: Arc<EventPublisher>,
    pub budget_guard: BudgetGuard,
    pub gate_manager: GateManager,
    pub task_initializer: TaskInitializer,
    pub backoff: BackoffCalculator,
    pub max_concurrent_tasks: usize,
    pub command_buffer_size: usize,
}

impl std::fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerContext")
            .field("pipeline", &self.pipeline.name)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .finish_non_exhaustive()
    }
}

/// Mailbox of a spawned runner
#[derive(Debug, Clone)]
pub struct ExecutionRunnerHandle {
    execution_uuid: Uuid,
    sender: mpsc::Sender<RunnerCommand>,
}

impl ExecutionRunnerHandle {
    pub fn execution_uuid(&self) -> Uuid {
        self.execution_uuid
    }

    /// Whether the runner has exited
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the runner has exited
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    pub async fn send(&self, command: RunnerCommand) -> Result<(), RunnerCommand> {
        self.sender.send(command).await.map_err(|err| err.0)
    }
}

struct InvocationResult {
    task_uuid: Uuid,
    invocation_uuid: Uuid,
    outcome: InvocationOutcome,
}

pub struct ExecutionRunner {
    ctx: RunnerContext,
    machine: ExecutionStateMachine,
    commands: mpsc::Receiver<RunnerCommand>,
    invocations: JoinSet<InvocationResult>,
    /// task uuid -> invocation uuid of every dispatched, unfinished invocation
    in_flight: HashMap<Uuid, Uuid>,
    stage_tx: mpsc::UnboundedSender<StageUpdate>,
    stage_rx: mpsc::UnboundedReceiver<StageUpdate>,
    cancel_tx: watch::Sender<bool>,
    retry_wait: Option<Duration>,
    recorded_progress: f64,
}

impl ExecutionRunner {
    /// Spawn a runner for a persisted execution.
    ///
    /// `initial` is queued before the runner starts, so it is handled even
    /// when the execution is already terminal.
    pub fn spawn(
        ctx: RunnerContext,
        execution_uuid: Uuid,
        initial: Option<RunnerCommand>,
    ) -> ExecutionRunnerHandle {
        let (sender, commands) = mpsc::channel(ctx.command_buffer_size.max(1));
        if let Some(command) = initial {
            // Fresh channel with capacity >= 1: cannot be full or closed
            let _ = sender.try_send(command);
        }

        tokio::spawn(async move {
            let execution = match ctx.store.get_execution(execution_uuid).await {
                Ok(execution) => execution,
                Err(error) => {
                    log_error(
                        "execution_runner",
                        "load_execution",
                        &error.to_string(),
                        Some(&execution_uuid.to_string()),
                    );
                    return;
                }
            };
            let runner = Self::new(ctx, execution, commands);
            runner.run().await;
        });

        ExecutionRunnerHandle {
            execution_uuid,
            sender,
        }
    }

    fn new(
        ctx: RunnerContext,
        execution: Execution,
        commands: mpsc::Receiver<RunnerCommand>,
    ) -> Self {
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();
        let (cancel_tx, _) = watch::channel(execution.state == ExecutionState::Cancelled);
        let recorded_progress = execution.progress;
        let machine = ExecutionStateMachine::new(
            execution,
            ctx.pipeline.phase_count(),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.event_publisher),
        );
        Self {
            ctx,
            machine,
            commands,
            invocations: JoinSet::new(),
            in_flight: HashMap::new(),
            stage_tx,
            stage_rx,
            cancel_tx,
            retry_wait: None,
            recorded_progress,
        }
    }

    fn execution_uuid(&self) -> Uuid {
        self.machine.execution().execution_uuid
    }

    async fn run(mut self) {
        info!(
            execution_uuid = %self.execution_uuid(),
            state = %self.machine.current_state(),
            "Execution runner started"
        );

        if let Err(error) = self.reconcile_orphans().await {
            self.report_error("reconcile_orphans", &error);
        }
        self.drive().await;

        loop {
            if self.is_idle_and_terminal() {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                        self.drive().await;
                        continue;
                    }
                    Err(_) => break,
                }
            }

            let retry_wait = self.retry_wait;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(joined) = self.invocations.join_next(), if !self.invocations.is_empty() => {
                    self.handle_joined(joined).await;
                }
                Some(update) = self.stage_rx.recv() => {
                    self.handle_stage_update(update).await;
                }
                _ = tokio::time::sleep(retry_wait.unwrap_or_default()), if retry_wait.is_some() => {
                    self.retry_wait = None;
                }
            }
            self.drive().await;
        }

        self.invocations.abort_all();
        info!(
            execution_uuid = %self.execution_uuid(),
            state = %self.machine.current_state(),
            "Execution runner stopped"
        );
    }

    fn is_idle_and_terminal(&self) -> bool {
        self.machine.current_state().is_terminal() && self.invocations.is_empty()
    }

    /// Returns `false` when the runner should stop
    async fn handle_command(&mut self, command: RunnerCommand) -> bool {
        match command {
            RunnerCommand::Tick => {}
            RunnerCommand::ResolveGate {
                request,
                respond_to,
            } => {
                let result = self.resolve_gate(request).await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::Retry { respond_to } => {
                let result = self.retry().await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::Pause { respond_to } => {
                let result = self.set_paused(true).await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::Resume { respond_to } => {
                let result = self.set_paused(false).await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::Cancel { respond_to } => {
                let result = self.cancel().await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::ResolveTaskManually {
                task_uuid,
                artifact,
                respond_to,
            } => {
                let result = self
                    .override_task(task_uuid, TaskEvent::ResolveManually { artifact })
                    .await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::SkipTask {
                task_uuid,
                respond_to,
            } => {
                let result = self.override_task(task_uuid, TaskEvent::Skip).await;
                let _ = respond_to.send(result);
            }
            RunnerCommand::Shutdown => return false,
        }
        true
    }

    // ----------------------------------------------------------------------
    // Driving the execution forward
    // ----------------------------------------------------------------------

    async fn drive(&mut self) {
        for _ in 0..MAX_DRIVE_STEPS {
            match self.step().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(error) => {
                    self.handle_drive_error(error).await;
                    break;
                }
            }
        }
        self.record_progress().await;
    }

    /// Advance by one decision; `true` when another pass may make progress
    async fn step(&mut self) -> OrchestrationResult<bool> {
        match self.machine.current_state().clone() {
            ExecutionState::Initialized => {
                self.machine.transition(ExecutionEvent::Start).await?;
                Ok(true)
            }
            ExecutionState::PhaseRunning(phase) => self.step_phase(phase).await,
            ExecutionState::PhaseComplete(phase) => self.step_phase_complete(phase).await,
            ExecutionState::Waiting { .. } => self.step_waiting().await,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled => {
                Ok(false)
            }
        }
    }

    async fn step_phase(&mut self, phase: usize) -> OrchestrationResult<bool> {
        let execution = self.machine.execution().clone();
        self.ctx
            .task_initializer
            .ensure_phase_tasks(&self.ctx.store, &execution, phase)
            .await?;
        let all_tasks = self.ctx.store.list_tasks(execution.execution_uuid).await?;
        let graph = TaskGraph::for_phase(&all_tasks, phase);

        if let Some(task) = graph.exhausted_tasks().first() {
            let mut machine = self.task_machine((*task).clone());
            machine.transition(TaskEvent::Exhaust, &graph.statuses()).await?;
            return Ok(true);
        }

        if let Some(unreachable) = graph.unreachable_tasks().first() {
            let blocker_key = graph
                .get(unreachable.blocked_by)
                .map_or_else(|| unreachable.blocked_by.to_string(), |t| t.task_key.clone());
            if let Some(task) = graph.get(unreachable.task_uuid) {
                let mut machine = self.task_machine(task.clone());
                machine
                    .transition(
                        TaskEvent::Block(format!("dependency '{blocker_key}' will not complete")),
                        &graph.statuses(),
                    )
                    .await?;
                return Ok(true);
            }
        }

        match graph.evaluate_completion() {
            PhaseCompletion::Complete => {
                self.machine.transition(ExecutionEvent::CompletePhase).await?;
                Ok(true)
            }
            PhaseCompletion::Stalled { blockers } => {
                let reason = match blockers.first().and_then(|uuid| graph.get(*uuid)) {
                    Some(blocker) => self.stall_reason(&graph, blocker).await,
                    None => FailureReason::Internal {
                        message: "phase stalled without a blocker".to_string(),
                        task_uuid: None,
                        phase: Some(phase),
                    },
                };
                self.fail_execution(reason).await?;
                Ok(true)
            }
            PhaseCompletion::Incomplete { .. } => {
                self.dispatch_ready(&execution, &all_tasks, &graph).await
            }
        }
    }

    async fn stall_reason(&self, graph: &TaskGraph<'_>, blocker: &TaskRecord) -> FailureReason {
        if let Some(dependency) = blocker
            .dependencies
            .iter()
            .filter_map(|uuid| graph.get(*uuid))
            .find(|dep| matches!(dep.status, TaskStatus::Blocked | TaskStatus::Skipped))
        {
            return FailureReason::DependencyBlocked {
                task_uuid: blocker.task_uuid,
                task_key: blocker.task_key.clone(),
                phase: blocker.phase,
                blocked_by: dependency.task_key.clone(),
            };
        }

        let exhausted = match self.ctx.store.list_task_transitions(blocker.task_uuid).await {
            Ok(transitions) => transitions
                .last()
                .is_some_and(|transition| transition.event == TaskEvent::Exhaust.event_type()),
            Err(_) => blocker.has_exceeded_max_attempts(),
        };
        if exhausted {
            FailureReason::TaskExhausted {
                task_uuid: blocker.task_uuid,
                task_key: blocker.task_key.clone(),
                phase: blocker.phase,
                attempts: blocker.attempts,
                last_error: blocker.last_error.clone(),
            }
        } else {
            FailureReason::TaskPermanentFailure {
                task_uuid: blocker.task_uuid,
                task_key: blocker.task_key.clone(),
                phase: blocker.phase,
                last_error: blocker.last_error.clone(),
            }
        }
    }

    async fn dispatch_ready(
        &mut self,
        execution: &Execution,
        all_tasks: &[TaskRecord],
        graph: &TaskGraph<'_>,
    ) -> OrchestrationResult<bool> {
        let now = Utc::now();
        self.retry_wait = graph
            .next_retry_at()
            .filter(|at| *at > now)
            .and_then(|at| (at - now).to_std().ok());

        if execution.paused || *self.cancel_tx.borrow() {
            return Ok(false);
        }

        let capacity = self
            .ctx
            .max_concurrent_tasks
            .saturating_sub(self.in_flight.len());
        let ready: Vec<&TaskRecord> = graph
            .ready_tasks(now)
            .into_iter()
            .filter(|task| !self.in_flight.contains_key(&task.task_uuid))
            .take(capacity)
            .collect();
        if ready.is_empty() {
            return Ok(false);
        }

        let inputs: BTreeMap<String, String> = all_tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .filter_map(|task| {
                task.artifact
                    .as_ref()
                    .map(|artifact| (task.task_key.clone(), artifact.clone()))
            })
            .collect();
        let revision_notes = self
            .ctx
            .gate_manager
            .latest_gate_for_phase(execution.execution_uuid, execution.current_phase)
            .await?
            .filter(|gate| gate.resolution == GateResolution::RevisionRequested)
            .and_then(|gate| gate.notes);

        let statuses = graph.statuses();
        for task in ready {
            if !self
                .dispatch_task(execution, task, &statuses, &inputs, &revision_notes)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reserve, start and invoke one task; `false` when the execution halted
    async fn dispatch_task(
        &mut self,
        execution: &Execution,
        task: &TaskRecord,
        statuses: &DependencyStatuses,
        inputs: &BTreeMap<String, String>,
        revision_notes: &Option<String>,
    ) -> OrchestrationResult<bool> {
        let Some(role) = self.ctx.registry.get(&task.role).cloned() else {
            let mut machine = self.task_machine(task.clone());
            machine
                .transition(
                    TaskEvent::Block(format!("role '{}' is not registered", task.role)),
                    statuses,
                )
                .await?;
            return Ok(true);
        };

        let invocation_uuid = Uuid::new_v4();
        let key = ChargeKey(invocation_uuid);
        let decision = self
            .ctx
            .budget_guard
            .reserve_or_reject(execution.execution_uuid, key, role.estimated_cost)
            .await?;
        if let Some(reason) = BudgetGuard::reservation_failure(&decision, task) {
            self.fail_execution(reason).await?;
            return Ok(false);
        }

        let mut machine = self.task_machine(task.clone());
        if let Err(error) = machine
            .transition(TaskEvent::Start { invocation_uuid }, statuses)
            .await
        {
            self.ctx
                .budget_guard
                .release(execution.execution_uuid, key)
                .await?;
            return Err(error.into());
        }
        let started = machine.into_task();

        log_task_operation(
            "dispatch",
            execution.execution_uuid,
            started.task_uuid,
            &started.task_key,
            started.role.as_str(),
            &started.status.to_string(),
            Some(&format!("attempt {} of {}", started.attempts, started.max_attempts)),
        );

        let phase_name = self
            .ctx
            .pipeline
            .phase(started.phase)
            .map(|phase| phase.name.clone())
            .unwrap_or_default();
        let request = AgentRequest {
            execution_uuid: execution.execution_uuid,
            project_uuid: execution.project_uuid,
            task_uuid: started.task_uuid,
            invocation_uuid,
            task_key: started.task_key.clone(),
            role: started.role.clone(),
            phase: started.phase,
            phase_name,
            attempt: started.attempts,
            max_attempts: started.max_attempts,
            inputs: inputs.clone(),
            revision_notes: revision_notes.clone(),
        };
        let context = InvocationContext::new(
            StageReporter::new(started.task_uuid, invocation_uuid, self.stage_tx.clone()),
            self.cancel_tx.subscribe(),
        );

        let gateway = Arc::clone(&self.ctx.gateway);
        let task_uuid = started.task_uuid;
        self.in_flight.insert(task_uuid, invocation_uuid);
        self.invocations.spawn(async move {
            let outcome = gateway.invoke(&role, request, context).await;
            InvocationResult {
                task_uuid,
                invocation_uuid,
                outcome,
            }
        });
        Ok(true)
    }

    async fn step_phase_complete(&mut self, phase: usize) -> OrchestrationResult<bool> {
        let Some(definition) = self.ctx.pipeline.phase(phase).cloned() else {
            return Err(OrchestrationError::InvalidPipeline(format!(
                "phase index {phase} out of range"
            )));
        };
        let is_last = phase + 1 >= self.ctx.pipeline.phase_count();
        let advance = if is_last {
            ExecutionEvent::Finish
        } else {
            ExecutionEvent::Advance
        };

        if definition.gate.is_none() {
            self.machine.transition(advance).await?;
            return Ok(true);
        }

        let execution_uuid = self.execution_uuid();
        let latest = self
            .ctx
            .gate_manager
            .latest_gate_for_phase(execution_uuid, phase)
            .await?;
        match latest {
            Some(gate) if gate.is_pending() => {
                self.machine.transition(ExecutionEvent::AwaitGate(gate.name)).await?;
            }
            Some(gate) if gate.resolution == GateResolution::Approved => {
                self.machine.transition(advance).await?;
            }
            Some(gate) if gate.resolution == GateResolution::Rejected => {
                self.machine.transition(ExecutionEvent::Cancel).await?;
            }
            previous => {
                let tasks = self.ctx.store.list_tasks(execution_uuid).await?;
                let phase_tasks: Vec<&TaskRecord> =
                    tasks.iter().filter(|task| task.phase == phase).collect();
                let gate = self
                    .ctx
                    .gate_manager
                    .open_gate(
                        execution_uuid,
                        phase,
                        &definition,
                        &phase_tasks,
                        previous.map(|gate| gate.round),
                    )
                    .await?;
                self.machine.transition(ExecutionEvent::AwaitGate(gate.name)).await?;
            }
        }
        Ok(true)
    }

    async fn step_waiting(&mut self) -> OrchestrationResult<bool> {
        let execution = self.machine.execution();
        let latest = self
            .ctx
            .gate_manager
            .latest_gate_for_phase(execution.execution_uuid, execution.current_phase)
            .await?;
        match latest {
            Some(gate) if !gate.is_pending() => {
                self.apply_gate_decision(&gate).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_gate_decision(&mut self, gate: &Gate) -> OrchestrationResult<()> {
        match gate.resolution {
            GateResolution::Pending => {}
            GateResolution::Approved => {
                self.machine.transition(ExecutionEvent::ApproveGate).await?;
            }
            GateResolution::Rejected => {
                self.machine.transition(ExecutionEvent::RejectGate).await?;
            }
            GateResolution::RevisionRequested => {
                let tasks = self.ctx.store.list_tasks(gate.execution_uuid).await?;
                let phase_tasks: Vec<&TaskRecord> =
                    tasks.iter().filter(|task| task.phase == gate.phase).collect();
                let targets = self.ctx.gate_manager.revision_targets(gate, &phase_tasks);
                let empty = DependencyStatuses::new();
                for task in phase_tasks
                    .iter()
                    .filter(|task| targets.contains(&task.task_uuid))
                    .filter(|task| task.status != TaskStatus::Pending)
                {
                    let mut machine = self.task_machine((*task).clone());
                    machine.transition(TaskEvent::Reset, &empty).await?;
                }
                self.machine.transition(ExecutionEvent::ReviseGate).await?;
            }
        }
        Ok(())
    }

    async fn fail_execution(&mut self, reason: FailureReason) -> OrchestrationResult<()> {
        if self.machine.current_state().is_terminal() {
            return Ok(());
        }
        warn!(
            execution_uuid = %self.execution_uuid(),
            failure_kind = reason.label(),
            failure = %reason,
            "Execution failed"
        );
        self.machine.transition(ExecutionEvent::Fail(reason)).await?;
        Ok(())
    }

    async fn handle_drive_error(&mut self, error: OrchestrationError) {
        let conflict = matches!(
            error,
            OrchestrationError::Store(StoreError::Conflict(_))
                | OrchestrationError::StateMachine(StateMachineError::Persistence(
                    StoreError::Conflict(_)
                ))
        );
        if conflict {
            warn!(
                execution_uuid = %self.execution_uuid(),
                error = %error,
                "Stale execution view; reloading"
            );
            if let Err(reload_error) = self.reload().await {
                self.report_error("reload", &reload_error);
            }
            return;
        }

        self.report_error("drive", &error);
        let reason = FailureReason::Internal {
            message: error.to_string(),
            task_uuid: None,
            phase: Some(self.machine.execution().current_phase),
        };
        if let Err(fail_error) = self.fail_execution(reason).await {
            self.report_error("fail_execution", &fail_error);
        }
    }

    async fn reload(&mut self) -> OrchestrationResult<()> {
        let execution = self
            .ctx
            .store
            .get_execution(self.execution_uuid())
            .await
            .map_err(OrchestrationError::from_lookup)?;
        self.machine = ExecutionStateMachine::new(
            execution,
            self.ctx.pipeline.phase_count(),
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.event_publisher),
        );
        Ok(())
    }

    async fn record_progress(&mut self) {
        let records = match self.ctx.store.load_records(self.execution_uuid()).await {
            Ok(records) => records,
            Err(error) => {
                debug!(
                    execution_uuid = %self.execution_uuid(),
                    error = %error,
                    "Skipped progress update: records unavailable"
                );
                return;
            }
        };
        let progress = ProgressAggregator::compute(&self.ctx.pipeline, &records).overall_progress;
        if (progress - self.recorded_progress).abs() < 0.01
            || records.execution.state != *self.machine.current_state()
        {
            return;
        }
        let mut execution = self.machine.execution().clone();
        execution.progress = progress;
        match self.machine.save(execution).await {
            Ok(()) => self.recorded_progress = progress,
            Err(error) => debug!(
                execution_uuid = %self.execution_uuid(),
                error = %error,
                "Skipped progress update"
            ),
        }
    }

    // ----------------------------------------------------------------------
    // Invocation results and stage reports
    // ----------------------------------------------------------------------

    async fn handle_joined(&mut self, joined: Result<InvocationResult, JoinError>) {
        match joined {
            Ok(result) => {
                self.drain_stage_updates().await;
                self.in_flight.remove(&result.task_uuid);
                if let Err(error) = self.handle_result(result).await {
                    self.handle_drive_error(error).await;
                }
            }
            Err(error) => {
                // Panics are caught by the gateway; this is an abort during shutdown
                debug!(
                    execution_uuid = %self.execution_uuid(),
                    error = %error,
                    "Invocation task ended without a result"
                );
            }
        }
    }

    async fn handle_result(&mut self, result: InvocationResult) -> OrchestrationResult<()> {
        let execution_uuid = self.execution_uuid();
        let key = ChargeKey(result.invocation_uuid);
        let task = self
            .ctx
            .store
            .get_task(result.task_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)?;

        if task.invocation_uuid != Some(result.invocation_uuid) || !task.status.is_active() {
            // The task moved on without this invocation; only settle its money
            match result.outcome {
                InvocationOutcome::Success { cost, .. } => {
                    self.ctx
                        .budget_guard
                        .commit(execution_uuid, key, cost)
                        .await?;
                }
                _ => self.ctx.budget_guard.release(execution_uuid, key).await?,
            }
            debug!(
                execution_uuid = %execution_uuid,
                task_uuid = %result.task_uuid,
                "Discarded stale invocation result"
            );
            return Ok(());
        }

        log_task_operation(
            "result",
            execution_uuid,
            task.task_uuid,
            &task.task_key,
            task.role.as_str(),
            result.outcome.label(),
            None,
        );

        let empty = DependencyStatuses::new();
        let is_build = self
            .ctx
            .registry
            .get(&task.role)
            .is_some_and(|role| role.is_build());
        let mut machine = self.task_machine(task);

        match result.outcome {
            InvocationOutcome::Success {
                artifact,
                cost,
                summary,
            } => {
                if is_build {
                    Self::advance_build_chain(&mut machine, TaskStatus::Committing).await?;
                }
                let outcome = machine
                    .transition_with_charge(TaskEvent::Complete { artifact }, key, cost)
                    .await?;
                self.ctx
                    .budget_guard
                    .record_charge(execution_uuid, Some(machine.task()), key, cost, &outcome)
                    .await;

                if let Some(reason) = BudgetGuard::charge_failure(&outcome, machine.task()) {
                    self.ctx.budget_guard.release(execution_uuid, key).await?;
                    machine
                        .transition(
                            TaskEvent::fail_with_error(system::BUDGET_EXCEEDED_REASON),
                            &empty,
                        )
                        .await?;
                    self.fail_execution(reason).await?;
                } else if let Some(summary) = summary {
                    self.ctx
                        .store
                        .record_task_message(result.task_uuid, result.invocation_uuid, &summary)
                        .await?;
                }
            }
            InvocationOutcome::TransientFailure {
                reason,
                retry_after,
            } => {
                self.ctx.budget_guard.release(execution_uuid, key).await?;
                let attempts = machine.task().attempts;
                let backoff = self.ctx.backoff.calculate(attempts, retry_after);
                machine
                    .transition(
                        TaskEvent::Fail {
                            error: reason,
                            retry_at: Some(backoff.next_retry_at),
                        },
                        &empty,
                    )
                    .await?;
            }
            InvocationOutcome::PermanentFailure { reason } => {
                self.ctx.budget_guard.release(execution_uuid, key).await?;
                machine.transition(TaskEvent::Block(reason), &empty).await?;
            }
        }
        Ok(())
    }

    /// Walk the build chain forward until the task reaches `until`
    async fn advance_build_chain(
        machine: &mut TaskStateMachine,
        until: TaskStatus,
    ) -> OrchestrationResult<()> {
        const CHAIN: [TaskStatus; 5] = [
            TaskStatus::Running,
            TaskStatus::Deploying,
            TaskStatus::Testing,
            TaskStatus::Passed,
            TaskStatus::Committing,
        ];
        let position = |status: TaskStatus| CHAIN.iter().position(|s| *s == status);
        let Some(target) = position(until) else {
            return Ok(());
        };
        let empty = DependencyStatuses::new();

        while let Some(current) = position(machine.current_state()) {
            if current >= target {
                break;
            }
            let event = match machine.current_state() {
                TaskStatus::Running => TaskEvent::Deploy,
                TaskStatus::Deploying => TaskEvent::RunTests,
                TaskStatus::Testing => TaskEvent::TestsPassed,
                _ => TaskEvent::Commit,
            };
            machine.transition(event, &empty).await?;
        }
        Ok(())
    }

    async fn drain_stage_updates(&mut self) {
        while let Ok(update) = self.stage_rx.try_recv() {
            self.handle_stage_update(update).await;
        }
    }

    async fn handle_stage_update(&mut self, update: StageUpdate) {
        if self.in_flight.get(&update.task_uuid) != Some(&update.invocation_uuid) {
            return;
        }
        let result = match update.kind {
            StageUpdateKind::Message(message) => self
                .ctx
                .store
                .record_task_message(update.task_uuid, update.invocation_uuid, &message)
                .await
                .map_err(OrchestrationError::from),
            StageUpdateKind::Stage(stage) => self.apply_stage(&update, stage.event()).await,
        };
        if let Err(error) = result {
            warn!(
                execution_uuid = %self.execution_uuid(),
                task_uuid = %update.task_uuid,
                error = %error,
                "Ignored stage report"
            );
        }
    }

    async fn apply_stage(
        &mut self,
        update: &StageUpdate,
        event: TaskEvent,
    ) -> OrchestrationResult<()> {
        let task = self.ctx.store.get_task(update.task_uuid).await?;
        let is_build = self
            .ctx
            .registry
            .get(&task.role)
            .is_some_and(|role| role.is_build());
        if !is_build || task.invocation_uuid != Some(update.invocation_uuid) {
            return Ok(());
        }
        let until = match event {
            TaskEvent::Deploy => TaskStatus::Deploying,
            TaskEvent::RunTests => TaskStatus::Testing,
            TaskEvent::TestsPassed => TaskStatus::Passed,
            _ => TaskStatus::Committing,
        };
        let mut machine = self.task_machine(task);
        Self::advance_build_chain(&mut machine, until).await
    }

    // ----------------------------------------------------------------------
    // Commands
    // ----------------------------------------------------------------------

    async fn resolve_gate(&mut self, request: GateResolutionRequest) -> OrchestrationResult<Gate> {
        let execution = self.machine.execution().clone();
        let gates = self.ctx.store.list_gates(execution.execution_uuid).await?;

        let waiting_gate = match &execution.state {
            ExecutionState::Waiting { gate } => {
                GateManager::latest_in(&gates, execution.current_phase)
                    .filter(|latest| latest.name == *gate && latest.is_pending())
                    .cloned()
            }
            _ => None,
        };

        let gate = match (waiting_gate, request.gate_uuid) {
            (Some(gate), None) => gate,
            (Some(gate), Some(expected)) if gate.gate_uuid == expected => gate,
            (_, expected) => {
                // Not waiting on this gate: explain why
                let referenced = match expected {
                    Some(uuid) => gates.iter().find(|gate| gate.gate_uuid == uuid),
                    None => gates.iter().max_by_key(|gate| (gate.phase, gate.round)),
                };
                return Err(match referenced {
                    Some(gate) if !gate.is_pending() => OrchestrationError::GateAlreadyResolved {
                        gate_uuid: gate.gate_uuid,
                        resolution: gate.resolution,
                    },
                    _ => OrchestrationError::GateNotPending {
                        execution_uuid: execution.execution_uuid,
                        state: execution.state.to_string(),
                    },
                });
            }
        };

        if !request.revise_tasks.is_empty() {
            let tasks = self.ctx.store.list_tasks(execution.execution_uuid).await?;
            let phase_tasks: Vec<&TaskRecord> =
                tasks.iter().filter(|task| task.phase == gate.phase).collect();
            GateManager::validate_revise_targets(&request, &phase_tasks)?;
        }

        let resolved = self.ctx.gate_manager.resolve(&gate, &request).await?;
        self.apply_gate_decision(&resolved).await?;
        Ok(resolved)
    }

    async fn retry(&mut self) -> OrchestrationResult<ExecutionState> {
        let execution = self.machine.execution().clone();
        if execution.state != ExecutionState::Failed {
            return Err(OrchestrationError::NotRetryable {
                execution_uuid: execution.execution_uuid,
                state: execution.state.to_string(),
            });
        }

        let tasks = self.ctx.store.list_tasks(execution.execution_uuid).await?;
        let empty = DependencyStatuses::new();
        for task in tasks
            .into_iter()
            .filter(|task| task.phase == execution.current_phase)
            .filter(|task| task.status.is_error())
        {
            let mut machine = self.task_machine(task);
            machine.transition(TaskEvent::Reset, &empty).await?;
        }

        let state = self.machine.transition(ExecutionEvent::Retry).await?;
        log_execution_operation(
            "retry",
            execution.execution_uuid,
            &state.to_string(),
            execution.failure.as_ref().map(|reason| reason.label()),
        );
        Ok(state)
    }

    async fn set_paused(&mut self, paused: bool) -> OrchestrationResult<()> {
        let execution = self.machine.execution().clone();
        if execution.is_terminal() {
            return Err(OrchestrationError::ExecutionTerminal {
                execution_uuid: execution.execution_uuid,
                state: execution.state.to_string(),
            });
        }
        if execution.paused == paused {
            return Ok(());
        }

        let mut updated = execution;
        updated.paused = paused;
        self.machine.save(updated).await?;

        let (operation, event_name) = if paused {
            ("pause", event_names::EXECUTION_PAUSED)
        } else {
            ("resume", event_names::EXECUTION_RESUMED)
        };
        let execution = self.machine.execution();
        log_execution_operation(
            operation,
            execution.execution_uuid,
            &execution.state.to_string(),
            Some(&format!("{} invocations in flight", self.in_flight.len())),
        );
        let _ = self
            .ctx
            .event_publisher
            .publish(
                event_name,
                json!({
                    "execution_uuid": execution.execution_uuid,
                    "state": execution.state.to_string(),
                    "in_flight": self.in_flight.len(),
                }),
            )
            .await;
        Ok(())
    }

    async fn cancel(&mut self) -> OrchestrationResult<ExecutionState> {
        let execution = self.machine.execution().clone();
        if execution.is_terminal() {
            return Err(OrchestrationError::ExecutionTerminal {
                execution_uuid: execution.execution_uuid,
                state: execution.state.to_string(),
            });
        }
        if let ExecutionState::Waiting { gate } = &execution.state {
            self.close_gate_on_cancel(&execution, gate).await?;
        }
        self.cancel_tx.send_replace(true);
        let state = self.machine.transition(ExecutionEvent::Cancel).await?;
        log_execution_operation(
            "cancel",
            execution.execution_uuid,
            &state.to_string(),
            Some(&format!("{} invocations signalled", self.in_flight.len())),
        );
        Ok(state)
    }

    /// Reject the review an execution is parked on so it cannot be resolved later
    async fn close_gate_on_cancel(
        &self,
        execution: &Execution,
        gate_name: &str,
    ) -> OrchestrationResult<()> {
        let gates = self.ctx.store.list_gates(execution.execution_uuid).await?;
        let Some(pending) = GateManager::latest_in(&gates, execution.current_phase)
            .filter(|latest| latest.name == gate_name && latest.is_pending())
        else {
            return Ok(());
        };

        let request = GateResolutionRequest::reject(execution.execution_uuid)
            .by(system::CANCEL_GATE_ACTOR)
            .with_notes(system::CANCEL_GATE_NOTES);
        match self.ctx.gate_manager.resolve(pending, &request).await {
            Ok(_) | Err(OrchestrationError::GateAlreadyResolved { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn override_task(
        &mut self,
        task_uuid: Uuid,
        event: TaskEvent,
    ) -> OrchestrationResult<TaskRecord> {
        let execution = self.machine.execution().clone();
        if matches!(
            execution.state,
            ExecutionState::Completed | ExecutionState::Cancelled
        ) {
            return Err(OrchestrationError::ExecutionTerminal {
                execution_uuid: execution.execution_uuid,
                state: execution.state.to_string(),
            });
        }
        if execution.state != ExecutionState::Failed && !execution.paused {
            return Err(OrchestrationError::InvalidOverride {
                reason: format!(
                    "execution must be failed or paused, is {}",
                    execution.state
                ),
            });
        }

        let task = self
            .ctx
            .store
            .get_task(task_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)?;
        if task.execution_uuid != execution.execution_uuid {
            return Err(OrchestrationError::TaskNotFound(task_uuid));
        }

        let operation = event.event_type();
        let mut machine = self.task_machine(task);
        machine
            .transition(event, &DependencyStatuses::new())
            .await
            .map_err(|error| match error {
                StateMachineError::InvalidTransition { .. }
                | StateMachineError::GuardFailed { .. } => OrchestrationError::InvalidOverride {
                    reason: error.to_string(),
                },
                other => OrchestrationError::StateMachine(other),
            })?;
        let task = machine.into_task();
        log_task_operation(
            operation,
            execution.execution_uuid,
            task.task_uuid,
            &task.task_key,
            task.role.as_str(),
            &task.status.to_string(),
            Some("operator override"),
        );
        Ok(task)
    }

    // ----------------------------------------------------------------------
    // Startup
    // ----------------------------------------------------------------------

    /// Invocations do not survive a restart: fail any task still marked active
    /// and drop every hold the previous process left behind
    async fn reconcile_orphans(&mut self) -> OrchestrationResult<()> {
        let execution_uuid = self.execution_uuid();
        let released = self
            .ctx
            .store
            .release_all_reservations(execution_uuid)
            .await?;
        if !released.is_zero() {
            info!(
                execution_uuid = %execution_uuid,
                released = %released,
                "Released reservations left by a previous runner"
            );
        }

        let tasks = self.ctx.store.list_tasks(execution_uuid).await?;
        let empty = DependencyStatuses::new();
        for task in tasks.into_iter().filter(|task| task.status.is_active()) {
            warn!(
                execution_uuid = %execution_uuid,
                task_uuid = %task.task_uuid,
                task_key = %task.task_key,
                status = %task.status,
                "Reconciling orphaned invocation"
            );
            let mut machine = self.task_machine(task);
            machine
                .transition(
                    TaskEvent::fail_with_error(system::ORPHANED_INVOCATION_REASON),
                    &empty,
                )
                .await?;
        }
        Ok(())
    }

    fn task_machine(&self, task: TaskRecord) -> TaskStateMachine {
        TaskStateMachine::new(
            task,
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.event_publisher),
        )
    }

    fn report_error(&self, operation: &str, error: &OrchestrationError) {
        log_error(
            "execution_runner",
            operation,
            &error.to_string(),
            Some(&self.execution_uuid().to_string()),
        );
    }
}
