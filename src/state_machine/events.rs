use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::FailureReason;

/// Events that can trigger execution state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Begin the first phase
    Start,
    /// Every required task of the running phase finished
    CompletePhase,
    /// Suspend on the gate attached to the completed phase
    AwaitGate(String),
    /// Move from a completed, ungated phase to the next one
    Advance,
    /// The last phase completed without a gate
    Finish,
    ApproveGate,
    ReviseGate,
    RejectGate,
    Fail(FailureReason),
    Cancel,
    /// Operator retry of a failed execution
    Retry,
}

impl ExecutionEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CompletePhase => "complete_phase",
            Self::AwaitGate(_) => "await_gate",
            Self::Advance => "advance",
            Self::Finish => "finish",
            Self::ApproveGate => "approve_gate",
            Self::ReviseGate => "revise_gate",
            Self::RejectGate => "reject_gate",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Fail(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Events that can trigger task status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Dispatch the task under a fresh invocation id
    Start { invocation_uuid: Uuid },
    Deploy,
    RunTests,
    TestsPassed,
    Commit,
    /// Mark the task complete with an optional artifact reference
    Complete { artifact: Option<String> },
    /// Attempt failed; `retry_at` is the earliest time it may run again
    Fail {
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Failed with no attempts left
    Exhaust,
    /// Non-recoverable failure or unreachable dependency
    Block(String),
    Skip,
    /// Return to pending for an operator retry or a gate revision
    Reset,
    /// Operator marks the task complete with a supplied artifact
    ResolveManually { artifact: Option<String> },
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Deploy => "deploy",
            Self::RunTests => "run_tests",
            Self::TestsPassed => "tests_passed",
            Self::Commit => "commit",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Exhaust => "exhaust",
            Self::Block(_) => "block",
            Self::Skip => "skip",
            Self::Reset => "reset",
            Self::ResolveManually { .. } => "resolve_manually",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail { error, .. } => Some(error),
            Self::Block(reason) => Some(reason),
            _ => None,
        }
    }

    /// Create a failure event with no backoff
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            retry_at: None,
        }
    }

    pub fn complete_with_artifact(artifact: impl Into<String>) -> Self {
        Self::Complete {
            artifact: Some(artifact.into()),
        }
    }

    pub fn start() -> Self {
        Self::Start {
            invocation_uuid: Uuid::new_v4(),
        }
    }
}
