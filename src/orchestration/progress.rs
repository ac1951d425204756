//! # Progress Aggregation
//!
//! Read-only snapshot of an execution for status queries.
//!
//! The snapshot is computed from one consistent read of the execution, its
//! tasks and its gates ([`ExecutionStore::load_records`]), never from runner
//! memory, so it is the same before and after a restart. Overall progress is
//! weighted by phase: finished phases contribute their full weight, the
//! current phase contributes its weight times the mean progress of its tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::database::{ExecutionRecords, ExecutionStore};
use crate::models::{Execution, FailureReason, Gate, TaskRecord};
use crate::registry::{AgentRoleId, PipelineDefinition};
use crate::state_machine::{ExecutionState, TaskStatus};

/// Coarse status for dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initializing,
    Running,
    Paused,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn from_execution(execution: &Execution) -> Self {
        match &execution.state {
            ExecutionState::Completed => Self::Completed,
            ExecutionState::Failed => Self::Failed,
            ExecutionState::Cancelled => Self::Cancelled,
            _ if execution.paused => Self::Paused,
            ExecutionState::Initialized => Self::Initializing,
            ExecutionState::Waiting { .. } => Self::Waiting,
            ExecutionState::PhaseRunning(_) | ExecutionState::PhaseComplete(_) => Self::Running,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_uuid: Uuid,
    pub task_key: String,
    pub role: AgentRoleId,
    /// One-based phase number
    pub phase: usize,
    pub status: TaskStatus,
    pub optional: bool,
    pub progress: f64,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Latest worker message, falling back to the last error
    pub last_message: Option<String>,
    pub last_error: Option<String>,
    pub artifact: Option<String>,
}

/// The pending gate an execution is waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGate {
    pub gate_uuid: Uuid,
    pub name: String,
    pub round: u32,
    pub coverage_score: f64,
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub execution_uuid: Uuid,
    pub project_uuid: Uuid,
    pub status: ExecutionStatus,
    /// Persisted state label, e.g. `phase_2_running`
    pub execution_state: String,
    /// Phase-weighted percentage, two decimals
    pub overall_progress: f64,
    pub current_phase: Option<String>,
    /// One-based phase number
    pub current_phase_index: usize,
    pub phase_count: usize,
    pub pending_gate: Option<PendingGate>,
    pub failure: Option<FailureReason>,
    pub tasks: Vec<TaskProgress>,
}

impl ProgressSnapshot {
    pub fn task(&self, task_key: &str) -> Option<&TaskProgress> {
        self.tasks.iter().find(|task| task.task_key == task_key)
    }
}

#[derive(Clone)]
pub struct ProgressAggregator {
    store: Arc<dyn ExecutionStore>,
    pipeline: Arc<PipelineDefinition>,
}

impl fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("pipeline", &self.pipeline.name)
            .finish_non_exhaustive()
    }
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn ExecutionStore>, pipeline: Arc<PipelineDefinition>) -> Self {
        Self { store, pipeline }
    }

    pub async fn snapshot(&self, execution_uuid: Uuid) -> OrchestrationResult<ProgressSnapshot> {
        let records = self
            .store
            .load_records(execution_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)?;
        Ok(Self::compute(&self.pipeline, &records))
    }

    /// Pure projection of persisted records into a snapshot
    pub fn compute(pipeline: &PipelineDefinition, records: &ExecutionRecords) -> ProgressSnapshot {
        let execution = &records.execution;
        let current = execution.current_phase;

        let pending_gate = records
            .gates
            .iter()
            .filter(|gate| gate.is_pending())
            .max_by_key(|gate| (gate.phase, gate.round))
            .map(|gate: &Gate| PendingGate {
                gate_uuid: gate.gate_uuid,
                name: gate.name.clone(),
                round: gate.round,
                coverage_score: gate.decision_input.coverage_score,
                meets_threshold: gate.decision_input.meets_threshold,
            });

        ProgressSnapshot {
            execution_uuid: execution.execution_uuid,
            project_uuid: execution.project_uuid,
            status: ExecutionStatus::from_execution(execution),
            execution_state: execution.state.to_string(),
            overall_progress: Self::overall_progress(pipeline, execution, &records.tasks),
            current_phase: pipeline.phase(current).map(|phase| phase.name.clone()),
            current_phase_index: current + 1,
            phase_count: pipeline.phase_count(),
            pending_gate,
            failure: execution.failure.clone(),
            tasks: records.tasks.iter().map(Self::task_progress).collect(),
        }
    }

    fn task_progress(task: &TaskRecord) -> TaskProgress {
        TaskProgress {
            task_uuid: task.task_uuid,
            task_key: task.task_key.clone(),
            role: task.role.clone(),
            phase: task.phase + 1,
            status: task.status,
            optional: task.optional,
            progress: task.status.progress_percentage(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            last_message: task.last_message.clone().or_else(|| task.last_error.clone()),
            last_error: task.last_error.clone(),
            artifact: task.artifact.clone(),
        }
    }

    fn overall_progress(
        pipeline: &PipelineDefinition,
        execution: &Execution,
        tasks: &[TaskRecord],
    ) -> f64 {
        if execution.state == ExecutionState::Completed {
            return 100.0;
        }
        let total_weight = pipeline.total_weight();
        if total_weight <= 0.0 || execution.state == ExecutionState::Initialized {
            return 0.0;
        }

        let current = execution.current_phase;
        let current_finished = matches!(
            execution.state,
            ExecutionState::PhaseComplete(_) | ExecutionState::Waiting { .. }
        );

        let earned: f64 = pipeline
            .phases
            .iter()
            .enumerate()
            .map(|(index, phase)| {
                let fraction = if index < current || (index == current && current_finished) {
                    1.0
                } else if index == current {
                    Self::phase_fraction(tasks, index)
                } else {
                    0.0
                };
                phase.weight * fraction
            })
            .sum();

        let percentage = (earned / total_weight * 100.0).clamp(0.0, 100.0);
        (percentage * 100.0).round() / 100.0
    }

    fn phase_fraction(tasks: &[TaskRecord], phase: usize) -> f64 {
        let (sum, count) = tasks
            .iter()
            .filter(|task| task.phase == phase)
            .fold((0.0, 0usize), |(sum, count), task| {
                (sum + task.status.progress_percentage(), count + 1)
            });
        if count == 0 {
            0.0
        } else {
            sum / count as f64 / 100.0
        }
    }
}
