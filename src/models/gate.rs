use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::registry::AgentRoleId;
use crate::state_machine::TaskStatus;

/// A suspension point that needs an external decision before the execution proceeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub gate_uuid: Uuid,
    pub execution_uuid: Uuid,
    /// Zero-based index of the phase this gate blocks
    pub phase: usize,
    pub name: String,
    /// 1 for the first review of a phase, incremented after each revision
    pub round: u32,
    pub decision_input: GateDecisionInput,
    pub resolution: GateResolution,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Task keys the approver flagged for rework on `revise`
    pub revise_tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Gate {
    pub fn new(
        execution_uuid: Uuid,
        phase: usize,
        name: impl Into<String>,
        round: u32,
        decision_input: GateDecisionInput,
    ) -> Self {
        Self {
            gate_uuid: Uuid::new_v4(),
            execution_uuid,
            phase,
            name: name.into(),
            round,
            decision_input,
            resolution: GateResolution::Pending,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            revise_tasks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolution == GateResolution::Pending
    }
}

/// Payload shown to the approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecisionInput {
    /// Fraction (0.0..=1.0) of the phase's tasks that completed with an artifact
    pub coverage_score: f64,
    pub meets_threshold: bool,
    pub gaps: Vec<GateGap>,
    pub artifacts: Vec<String>,
}

/// Something the approver should look at before deciding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateGap {
    pub task_key: String,
    pub role: AgentRoleId,
    pub status: TaskStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResolution {
    #[default]
    Pending,
    Approved,
    RevisionRequested,
    Rejected,
}

impl fmt::Display for GateResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::RevisionRequested => write!(f, "revision_requested"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for GateResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "revision_requested" => Ok(Self::RevisionRequested),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid gate resolution: {s}")),
        }
    }
}

/// External decision on a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approve,
    Revise,
    Reject,
}

impl GateDecision {
    pub fn resolution(&self) -> GateResolution {
        match self {
            Self::Approve => GateResolution::Approved,
            Self::Revise => GateResolution::RevisionRequested,
            Self::Reject => GateResolution::Rejected,
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Revise => write!(f, "revise"),
            Self::Reject => write!(f, "reject"),
        }
    }
}
