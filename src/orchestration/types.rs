//! Request and response types for the orchestrator's public operations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::progress::ProgressSnapshot;
use crate::models::{BudgetCeilings, Gate};
use crate::registry::AgentRoleId;

/// Start a new execution for a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub project_uuid: Uuid,
    /// Explicit role selection; mandatory roles must be present
    pub roles: Vec<AgentRoleId>,
    /// Ceilings for this execution; configured defaults when absent
    pub ceilings: Option<BudgetCeilings>,
}

impl StartExecutionRequest {
    pub fn new<I, R>(project_uuid: Uuid, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<AgentRoleId>,
    {
        Self {
            project_uuid,
            roles: roles.into_iter().map(Into::into).collect(),
            ceilings: None,
        }
    }

    pub fn with_ceilings(mut self, ceilings: BudgetCeilings) -> Self {
        self.ceilings = Some(ceilings);
        self
    }
}

/// Recorded decision plus the execution's status after it was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResolutionResponse {
    pub gate: Gate,
    pub progress: ProgressSnapshot,
}
