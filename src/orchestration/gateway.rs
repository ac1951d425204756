//! # Agent Invocation Gateway
//!
//! The only path from the orchestrator to an agent. Every invocation goes
//! through [`AgentGateway::invoke`], which applies the role's timeout class,
//! captures panics and normalizes whatever comes back into an
//! [`InvocationOutcome`].
//!
//! Cancelling an execution never drops a call in flight: the agent may
//! already be spending money, so the call runs until it returns or times out
//! and its cost is settled like any other. Workers that can stop early watch
//! [`InvocationContext::cancelled`] and return [`AgentError::Cancelled`].
//!
//! Workers implement [`AgentWorker`]. Build-style workers report their
//! deploy/test/commit progress through the [`StageReporter`] in the
//! [`InvocationContext`]; the runner turns those reports into task
//! transitions.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error_classifier::{ErrorClassifier, ErrorContext, StandardErrorClassifier};
use crate::config::TimeoutConfig;
use crate::constants::{sanitize_error_detail, system::MAX_MESSAGE_CHARS, truncate_chars};
use crate::models::Cost;
use crate::registry::{AgentRoleId, RoleDefinition};
use crate::state_machine::TaskEvent;

/// Failure reported by an agent worker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("invocation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("rate limited by agent provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported request: {0}")]
    Unsupported(String),

    #[error("agent internal error: {0}")]
    Internal(String),

    #[error("invocation cancelled")]
    Cancelled,
}

/// Everything an agent needs to perform one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub execution_uuid: Uuid,
    pub project_uuid: Uuid,
    pub task_uuid: Uuid,
    pub invocation_uuid: Uuid,
    pub task_key: String,
    pub role: AgentRoleId,
    /// Zero-based phase index
    pub phase: usize,
    pub phase_name: String,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
    pub max_attempts: u32,
    /// Artifacts of completed tasks in this execution, keyed by task key
    pub inputs: BTreeMap<String, String>,
    /// Reviewer notes when the phase is being revised after a gate
    pub revision_notes: Option<String>,
}

/// Successful agent result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Reference to the produced artifact
    pub artifact: Option<String>,
    /// Metered cost of the invocation
    pub cost: Cost,
    pub summary: Option<String>,
}

impl AgentOutput {
    pub fn new(artifact: impl Into<String>, cost: Cost) -> Self {
        Self {
            artifact: Some(artifact.into()),
            cost,
            summary: None,
        }
    }
}

/// Normalized result of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success {
        artifact: Option<String>,
        cost: Cost,
        summary: Option<String>,
    },
    /// Retry with backoff while attempts remain
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Never retried automatically
    PermanentFailure { reason: String },
}

impl InvocationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::TransientFailure { .. } => "transient_failure",
            Self::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Stage of the extended build chain reported by a build worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Deploying,
    Testing,
    Passed,
    Committing,
}

impl BuildStage {
    pub fn event(&self) -> TaskEvent {
        match self {
            Self::Deploying => TaskEvent::Deploy,
            Self::Testing => TaskEvent::RunTests,
            Self::Passed => TaskEvent::TestsPassed,
            Self::Committing => TaskEvent::Commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdateKind {
    Stage(BuildStage),
    Message(String),
}

/// Progress report from a running invocation
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub task_uuid: Uuid,
    pub invocation_uuid: Uuid,
    pub kind: StageUpdateKind,
}

/// Handle a worker uses to report progress for its invocation
#[derive(Debug, Clone)]
pub struct StageReporter {
    task_uuid: Uuid,
    invocation_uuid: Uuid,
    sender: mpsc::UnboundedSender<StageUpdate>,
}

impl StageReporter {
    pub fn new(
        task_uuid: Uuid,
        invocation_uuid: Uuid,
        sender: mpsc::UnboundedSender<StageUpdate>,
    ) -> Self {
        Self {
            task_uuid,
            invocation_uuid,
            sender,
        }
    }

    /// Reporter whose updates go nowhere
    pub fn detached() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self::new(Uuid::nil(), Uuid::nil(), sender)
    }

    pub fn stage(&self, stage: BuildStage) {
        self.send(StageUpdateKind::Stage(stage));
    }

    pub fn deploying(&self) {
        self.stage(BuildStage::Deploying);
    }

    pub fn testing(&self) {
        self.stage(BuildStage::Testing);
    }

    pub fn passed(&self) {
        self.stage(BuildStage::Passed);
    }

    pub fn committing(&self) {
        self.stage(BuildStage::Committing);
    }

    pub fn message(&self, message: impl AsRef<str>) {
        self.send(StageUpdateKind::Message(truncate_chars(
            message.as_ref(),
            MAX_MESSAGE_CHARS,
        )));
    }

    fn send(&self, kind: StageUpdateKind) {
        // A closed receiver means the runner is gone; the report is moot
        let _ = self.sender.send(StageUpdate {
            task_uuid: self.task_uuid,
            invocation_uuid: self.invocation_uuid,
            kind,
        });
    }
}

/// Per-invocation handles passed to a worker
#[derive(Debug, Clone)]
pub struct InvocationContext {
    reporter: StageReporter,
    cancellation: watch::Receiver<bool>,
}

impl InvocationContext {
    pub fn new(reporter: StageReporter, cancellation: watch::Receiver<bool>) -> Self {
        Self {
            reporter,
            cancellation,
        }
    }

    /// Context with no progress channel and no cancellation source
    pub fn detached() -> Self {
        let (_sender, cancellation) = watch::channel(false);
        Self::new(StageReporter::detached(), cancellation)
    }

    pub fn reporter(&self) -> &StageReporter {
        &self.reporter
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    /// Resolves once the execution is cancelled; never resolves otherwise
    pub async fn cancelled(&self) {
        let mut receiver = self.cancellation.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// An agent implementation for one or more roles
#[async_trait]
pub trait AgentWorker: Send + Sync + 'static {
    async fn invoke(
        &self,
        request: AgentRequest,
        context: InvocationContext,
    ) -> Result<AgentOutput, AgentError>;
}

/// Routes invocations to the worker registered for each role
pub struct AgentGateway {
    workers: DashMap<AgentRoleId, Arc<dyn AgentWorker>>,
    timeouts: TimeoutConfig,
    classifier: Arc<dyn ErrorClassifier>,
}

impl std::fmt::Debug for AgentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut roles: Vec<String> = self.workers.iter().map(|e| e.key().to_string()).collect();
        roles.sort();
        f.debug_struct("AgentGateway")
            .field("roles", &roles)
            .field("timeouts", &self.timeouts)
            .field("classifier", &self.classifier.classifier_name())
            .finish()
    }
}

impl AgentGateway {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self::with_classifier(timeouts, Arc::new(StandardErrorClassifier::new()))
    }

    pub fn with_classifier(timeouts: TimeoutConfig, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            workers: DashMap::new(),
            timeouts,
            classifier,
        }
    }

    pub fn register_worker(&self, role: impl Into<AgentRoleId>, worker: Arc<dyn AgentWorker>) {
        self.workers.insert(role.into(), worker);
    }

    pub fn has_worker(&self, role: &AgentRoleId) -> bool {
        self.workers.contains_key(role)
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Invoke the worker for `role`, never returning an error
    pub async fn invoke(
        &self,
        role: &RoleDefinition,
        request: AgentRequest,
        context: InvocationContext,
    ) -> InvocationOutcome {
        let Some(worker) = self.workers.get(&role.id).map(|entry| Arc::clone(entry.value())) else {
            warn!(role = %role.id, task_key = %request.task_key, "No worker registered for role");
            return InvocationOutcome::PermanentFailure {
                reason: format!("no worker registered for role {}", role.id),
            };
        };

        let timeout = self.timeouts.for_class(role.invocation_class);
        let error_context = ErrorContext {
            task_uuid: request.task_uuid,
            task_key: request.task_key.clone(),
            role: role.id.clone(),
            attempt_number: request.attempt,
            max_attempts: request.max_attempts,
            execution_duration: Duration::ZERO,
        };
        let started = Instant::now();

        let call = AssertUnwindSafe(worker.invoke(request, context)).catch_unwind();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(AgentError::Internal("agent worker panicked".to_string())),
            Err(_elapsed) => Err(AgentError::Timeout { after: timeout }),
        };

        match result {
            Ok(output) => {
                debug!(
                    role = %role.id,
                    task_key = %error_context.task_key,
                    cost = %output.cost,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Agent invocation succeeded"
                );
                InvocationOutcome::Success {
                    artifact: output.artifact,
                    cost: output.cost,
                    summary: output.summary.map(|s| truncate_chars(&s, MAX_MESSAGE_CHARS)),
                }
            }
            Err(error) => {
                let error_context = ErrorContext {
                    execution_duration: started.elapsed(),
                    ..error_context
                };
                let classification = self.classifier.classify_error(&error, &error_context);
                debug!(
                    role = %role.id,
                    task_key = %error_context.task_key,
                    category = %classification.error_category,
                    error_code = %classification.error_code,
                    retryable = classification.is_retryable,
                    "Agent invocation failed"
                );
                let reason = sanitize_error_detail(&classification.error_message);
                if classification.is_retryable {
                    InvocationOutcome::TransientFailure {
                        reason,
                        retry_after: classification.retry_delay,
                    }
                } else {
                    InvocationOutcome::PermanentFailure { reason }
                }
            }
        }
    }
}
