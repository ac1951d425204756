use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::budget::{BudgetScope, Cost};
use crate::registry::AgentRoleId;
use crate::state_machine::ExecutionState;

/// One run of the pipeline for a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_uuid: Uuid,
    pub project_uuid: Uuid,
    pub state: ExecutionState,
    /// Zero-based index of the phase the execution is in (or last ran)
    pub current_phase: usize,
    /// Agent roles selected when the execution was started
    pub selected_roles: Vec<AgentRoleId>,
    /// Operational pause flag; blocks dispatch without touching task status
    pub paused: bool,
    /// Last progress percentage recorded by the runner, kept for audit
    pub progress: f64,
    pub outcome: ExecutionOutcome,
    pub failure: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(project_uuid: Uuid, selected_roles: Vec<AgentRoleId>) -> Self {
        let now = Utc::now();
        Self {
            execution_uuid: Uuid::new_v4(),
            project_uuid,
            state: ExecutionState::Initialized,
            current_phase: 0,
            selected_roles,
            paused: false,
            progress: 0.0,
            outcome: ExecutionOutcome::None,
            failure: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_role(&self, role: &AgentRoleId) -> bool {
        self.selected_roles.contains(role)
    }
}

/// Terminal outcome of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    #[default]
    None,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution outcome: {s}")),
        }
    }
}

/// Why an execution ended up `failed`.
///
/// Budget exhaustion is its own variant: the remediation (raise a ceiling,
/// then retry) differs from fixing a broken task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A required task used up its retry attempts on transient failures
    TaskExhausted {
        task_uuid: Uuid,
        task_key: String,
        phase: usize,
        attempts: u32,
        last_error: Option<String>,
    },
    /// A required task hit a non-recoverable failure
    TaskPermanentFailure {
        task_uuid: Uuid,
        task_key: String,
        phase: usize,
        last_error: Option<String>,
    },
    /// A required task can never run because a dependency is blocked
    DependencyBlocked {
        task_uuid: Uuid,
        task_key: String,
        phase: usize,
        blocked_by: String,
    },
    BudgetExceeded {
        scope: BudgetScope,
        task_uuid: Option<Uuid>,
        attempted: Cost,
        spent: Cost,
        ceiling: Cost,
    },
    /// An unclassifiable error surfaced while driving the execution
    Internal {
        message: String,
        task_uuid: Option<Uuid>,
        phase: Option<usize>,
    },
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TaskExhausted { .. } => "task_exhausted",
            Self::TaskPermanentFailure { .. } => "task_permanent_failure",
            Self::DependencyBlocked { .. } => "dependency_blocked",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn is_budget_exhaustion(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }

    pub fn task_uuid(&self) -> Option<Uuid> {
        match self {
            Self::TaskExhausted { task_uuid, .. }
            | Self::TaskPermanentFailure { task_uuid, .. }
            | Self::DependencyBlocked { task_uuid, .. } => Some(*task_uuid),
            Self::BudgetExceeded { task_uuid, .. } | Self::Internal { task_uuid, .. } => {
                *task_uuid
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskExhausted {
                task_key,
                phase,
                attempts,
                last_error,
                ..
            } => write!(
                f,
                "task '{task_key}' in phase {} exhausted {attempts} attempts: {}",
                phase + 1,
                last_error.as_deref().unwrap_or("no error detail")
            ),
            Self::TaskPermanentFailure {
                task_key,
                phase,
                last_error,
                ..
            } => write!(
                f,
                "task '{task_key}' in phase {} failed permanently: {}",
                phase + 1,
                last_error.as_deref().unwrap_or("no error detail")
            ),
            Self::DependencyBlocked {
                task_key,
                phase,
                blocked_by,
                ..
            } => write!(
                f,
                "task '{task_key}' in phase {} is blocked by '{blocked_by}'",
                phase + 1
            ),
            Self::BudgetExceeded {
                scope,
                attempted,
                spent,
                ceiling,
                ..
            } => write!(
                f,
                "budget exceeded: {scope} spend {spent} + {attempted} \
                 would exceed ceiling {ceiling}"
            ),
            Self::Internal { message, .. } => write!(f, "internal error: {message}"),
        }
    }
}
