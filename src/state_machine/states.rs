use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state labels.
///
/// Phase indices are zero-based internally and rendered one-based, so
/// `PhaseRunning(0)` is `phase_1_running`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionState {
    /// Created, no phase started yet
    Initialized,
    /// Tasks of the phase are being dispatched
    PhaseRunning(usize),
    /// Every required task of the phase finished
    PhaseComplete(usize),
    /// Suspended on the named gate until an external decision arrives
    Waiting { gate: String },
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Check if this is a terminal state (no automatic transitions out)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Check if tasks may be dispatched in this state
    pub fn is_dispatching(&self) -> bool {
        matches!(self, Self::PhaseRunning(_))
    }

    pub fn phase_index(&self) -> Option<usize> {
        match self {
            Self::PhaseRunning(index) | Self::PhaseComplete(index) => Some(*index),
            _ => None,
        }
    }

    pub fn gate_name(&self) -> Option<&str> {
        match self {
            Self::Waiting { gate } => Some(gate),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::PhaseRunning(index) => write!(f, "phase_{}_running", index + 1),
            Self::PhaseComplete(index) => write!(f, "phase_{}_complete", index + 1),
            Self::Waiting { gate } => write!(f, "waiting_{gate}"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => return Ok(Self::Initialized),
            "completed" => return Ok(Self::Completed),
            "failed" => return Ok(Self::Failed),
            "cancelled" => return Ok(Self::Cancelled),
            _ => {}
        }

        if let Some(gate) = s.strip_prefix("waiting_") {
            if gate.is_empty() {
                return Err(format!("Invalid execution state: {s}"));
            }
            return Ok(Self::Waiting {
                gate: gate.to_string(),
            });
        }

        let phase = |rest: &str| -> Result<usize, String> {
            match rest.parse::<usize>() {
                Ok(number) if number >= 1 => Ok(number - 1),
                _ => Err(format!("Invalid execution state: {s}")),
            }
        };

        if let Some(rest) = s.strip_prefix("phase_") {
            if let Some(number) = rest.strip_suffix("_running") {
                return phase(number).map(Self::PhaseRunning);
            }
            if let Some(number) = rest.strip_suffix("_complete") {
                return phase(number).map(Self::PhaseComplete);
            }
        }

        Err(format!("Invalid execution state: {s}"))
    }
}

impl TryFrom<String> for ExecutionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionState> for String {
    fn from(state: ExecutionState) -> Self {
        state.to_string()
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::Initialized
    }
}

/// Task status definitions, including the extended build chain
/// (`running → deploying → testing → passed → committing → completed`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created with its phase, waiting for dependencies or dispatch
    Pending,
    /// Agent invocation in flight
    Running,
    /// Build-style task deploying its output
    Deploying,
    /// Build-style task running its test suite
    Testing,
    /// Build-style task whose tests passed, not yet committed
    Passed,
    /// Build-style task committing its artifact
    Committing,
    Completed,
    /// Attempt failed; may be retried while attempts remain
    Failed,
    /// Operator skipped the task
    Skipped,
    /// Permanently failed, exhausted, or unreachable because of a dependency
    Blocked,
}

impl TaskStatus {
    /// Check if this is a terminal status (no automatic transitions out)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Blocked)
    }

    /// Check if an invocation is in flight; `passed` and `committing` look
    /// like `running` to everything outside the build chain
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Deploying | Self::Testing | Self::Passed | Self::Committing
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }

    /// Only `completed` unblocks dependents
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Rough completion percentage used by the progress view
    pub fn progress_percentage(&self) -> f64 {
        match self {
            Self::Pending | Self::Failed | Self::Blocked => 0.0,
            Self::Running => 25.0,
            Self::Deploying => 50.0,
            Self::Testing => 70.0,
            Self::Passed => 85.0,
            Self::Committing => 95.0,
            Self::Completed | Self::Skipped => 100.0,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Deploying => write!(f, "deploying"),
            Self::Testing => write!(f, "testing"),
            Self::Passed => write!(f, "passed"),
            Self::Committing => write!(f, "committing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "deploying" => Ok(Self::Deploying),
            "testing" => Ok(Self::Testing),
            "passed" => Ok(Self::Passed),
            "committing" => Ok(Self::Committing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}
