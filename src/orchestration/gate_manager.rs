//! # Gate Manager
//!
//! Opens approval gates after gated phases, resolves them exactly once, and
//! works out which tasks a `revise` decision sends back to `pending`.
//!
//! Each review of a phase is its own gate record with an increasing `round`,
//! so the history of revise cycles stays queryable. Resolution is a
//! compare-and-set in the store: the first decision wins and every later one
//! is answered with [`OrchestrationError::GateAlreadyResolved`].

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::config::RevisionPolicy;
use crate::constants::events as event_names;
use crate::database::{ExecutionStore, GateResolveOutcome};
use crate::events::EventPublisher;
use crate::logging::log_gate_operation;
use crate::models::{Gate, GateDecision, GateDecisionInput, GateGap, TaskRecord};
use crate::registry::PhaseDefinition;
use crate::state_machine::TaskStatus;

/// An external decision on the pending gate of an execution
#[derive(Debug, Clone, PartialEq)]
pub struct GateResolutionRequest {
    pub execution_uuid: Uuid,
    /// Guards against resolving a newer gate than the caller looked at
    pub gate_uuid: Option<Uuid>,
    pub decision: GateDecision,
    pub notes: Option<String>,
    /// Task keys to rework on `revise`
    pub revise_tasks: Vec<String>,
    pub actor: Option<String>,
}

impl GateResolutionRequest {
    pub fn new(execution_uuid: Uuid, decision: GateDecision) -> Self {
        Self {
            execution_uuid,
            gate_uuid: None,
            decision,
            notes: None,
            revise_tasks: Vec::new(),
            actor: None,
        }
    }

    pub fn approve(execution_uuid: Uuid) -> Self {
        Self::new(execution_uuid, GateDecision::Approve)
    }

    pub fn reject(execution_uuid: Uuid) -> Self {
        Self::new(execution_uuid, GateDecision::Reject)
    }

    pub fn revise<I, S>(execution_uuid: Uuid, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut request = Self::new(execution_uuid, GateDecision::Revise);
        request.revise_tasks = tasks.into_iter().map(Into::into).collect();
        request
    }

    pub fn for_gate(mut self, gate_uuid: Uuid) -> Self {
        self.gate_uuid = Some(gate_uuid);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone)]
pub struct GateManager {
    store: Arc<dyn ExecutionStore>,
    event_publisher: Arc<EventPublisher>,
    revision_policy: RevisionPolicy,
}

impl std::fmt::Debug for GateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateManager")
            .field("revision_policy", &self.revision_policy)
            .finish_non_exhaustive()
    }
}

impl GateManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        event_publisher: Arc<EventPublisher>,
        revision_policy: RevisionPolicy,
    ) -> Self {
        Self {
            store,
            event_publisher,
            revision_policy,
        }
    }

    /// Build the approver payload from the phase's tasks
    pub fn evaluate(phase: &PhaseDefinition, tasks: &[&TaskRecord]) -> GateDecisionInput {
        let min_coverage = phase.gate.as_ref().map_or(1.0, |gate| gate.min_coverage);
        let covered: Vec<&TaskRecord> = tasks
            .iter()
            .copied()
            .filter(|task| task.status == TaskStatus::Completed && task.artifact.is_some())
            .collect();

        let coverage_score = if tasks.is_empty() {
            1.0
        } else {
            covered.len() as f64 / tasks.len() as f64
        };

        let gaps = tasks
            .iter()
            .filter(|task| !(task.status == TaskStatus::Completed && task.artifact.is_some()))
            .map(|task| GateGap {
                task_key: task.task_key.clone(),
                role: task.role.clone(),
                status: task.status,
                detail: match (task.status, &task.last_error) {
                    (TaskStatus::Completed, _) => "completed without an artifact".to_string(),
                    (TaskStatus::Skipped, _) => "skipped by operator".to_string(),
                    (_, Some(error)) => error.clone(),
                    (status, None) => format!("task is {status}"),
                },
            })
            .collect();

        GateDecisionInput {
            coverage_score: (coverage_score * 10_000.0).round() / 10_000.0,
            meets_threshold: coverage_score + f64::EPSILON >= min_coverage,
            gaps,
            artifacts: covered
                .iter()
                .filter_map(|task| task.artifact.clone())
                .collect(),
        }
    }

    /// Most recent gate record (any resolution) for a phase
    pub async fn latest_gate_for_phase(
        &self,
        execution_uuid: Uuid,
        phase: usize,
    ) -> OrchestrationResult<Option<Gate>> {
        let gates = self.store.list_gates(execution_uuid).await?;
        Ok(Self::latest_in(&gates, phase).cloned())
    }

    pub fn latest_in(gates: &[Gate], phase: usize) -> Option<&Gate> {
        gates
            .iter()
            .filter(|gate| gate.phase == phase)
            .max_by_key(|gate| gate.round)
    }

    /// Persist a new review round for a completed phase
    pub async fn open_gate(
        &self,
        execution_uuid: Uuid,
        phase_index: usize,
        phase: &PhaseDefinition,
        tasks: &[&TaskRecord],
        previous_round: Option<u32>,
    ) -> OrchestrationResult<Gate> {
        let gate_name = phase.gate.as_ref().map(|gate| gate.name.clone()).ok_or_else(|| {
            OrchestrationError::InvalidPipeline(format!("phase '{}' has no gate", phase.name))
        })?;

        let gate = Gate::new(
            execution_uuid,
            phase_index,
            gate_name,
            previous_round.map_or(1, |round| round + 1),
            Self::evaluate(phase, tasks),
        );
        self.store.insert_gate(&gate).await?;

        log_gate_operation(
            "open",
            execution_uuid,
            gate.gate_uuid,
            &gate.name,
            &gate.resolution.to_string(),
            None,
        );
        self.publish(
            event_names::GATE_OPENED,
            json!({
                "execution_uuid": execution_uuid,
                "gate_uuid": gate.gate_uuid,
                "gate": gate.name,
                "phase": phase_index + 1,
                "round": gate.round,
                "coverage_score": gate.decision_input.coverage_score,
                "meets_threshold": gate.decision_input.meets_threshold,
            }),
        )
        .await;
        Ok(gate)
    }

    /// Record the decision on `gate`; only the first decision is accepted
    pub async fn resolve(
        &self,
        gate: &Gate,
        request: &GateResolutionRequest,
    ) -> OrchestrationResult<Gate> {
        let mut resolved = gate.clone();
        resolved.resolution = request.decision.resolution();
        resolved.resolved_by = request.actor.clone();
        resolved.resolved_at = Some(Utc::now());
        resolved.notes = request.notes.clone();
        resolved.revise_tasks = request.revise_tasks.clone();

        match self.store.resolve_gate(&resolved).await? {
            GateResolveOutcome::Resolved(gate) => {
                log_gate_operation(
                    "resolve",
                    gate.execution_uuid,
                    gate.gate_uuid,
                    &gate.name,
                    &gate.resolution.to_string(),
                    gate.resolved_by.as_deref(),
                );
                self.publish(
                    event_names::GATE_RESOLVED,
                    json!({
                        "execution_uuid": gate.execution_uuid,
                        "gate_uuid": gate.gate_uuid,
                        "gate": gate.name,
                        "round": gate.round,
                        "resolution": gate.resolution,
                        "resolved_by": gate.resolved_by,
                        "revise_tasks": gate.revise_tasks,
                    }),
                )
                .await;
                Ok(gate)
            }
            GateResolveOutcome::AlreadyResolved(existing) => {
                Err(OrchestrationError::GateAlreadyResolved {
                    gate_uuid: existing.gate_uuid,
                    resolution: existing.resolution,
                })
            }
        }
    }

    /// Validate revise targets before the decision is recorded
    pub fn validate_revise_targets(
        request: &GateResolutionRequest,
        tasks: &[&TaskRecord],
    ) -> OrchestrationResult<()> {
        let known: HashSet<&str> = tasks.iter().map(|task| task.task_key.as_str()).collect();
        let unknown: Vec<&str> = request
            .revise_tasks
            .iter()
            .map(String::as_str)
            .filter(|key| !known.contains(key))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidOverride {
                reason: format!("revise targets not in the gated phase: {unknown:?}"),
            })
        }
    }

    /// Tasks of the gated phase that a `revise` decision resets to `pending`
    pub fn revision_targets(&self, gate: &Gate, tasks: &[&TaskRecord]) -> Vec<Uuid> {
        let all = || tasks.iter().map(|task| task.task_uuid).collect::<Vec<_>>();
        match self.revision_policy {
            RevisionPolicy::FullReplay => all(),
            RevisionPolicy::Targeted => {
                let flagged: HashSet<&str> =
                    gate.revise_tasks.iter().map(String::as_str).collect();
                let targets: Vec<Uuid> = tasks
                    .iter()
                    .filter(|task| {
                        flagged.contains(task.task_key.as_str())
                            || matches!(
                                task.status,
                                TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
                            )
                    })
                    .map(|task| task.task_uuid)
                    .collect();
                if targets.is_empty() {
                    all()
                } else {
                    targets
                }
            }
        }
    }

    async fn publish(&self, name: &str, context: serde_json::Value) {
        if let Err(error) = self.event_publisher.publish(name, context).await {
            warn!(event = name, error = %error, "Failed to publish gate event");
        }
    }
}
