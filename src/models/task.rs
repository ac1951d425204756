use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::budget::{ChargeKey, Cost};
use crate::registry::AgentRoleId;
use crate::state_machine::TaskStatus;

/// A unit of work assigned to exactly one agent role within a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_uuid: Uuid,
    pub execution_uuid: Uuid,
    /// Zero-based phase index
    pub phase: usize,
    /// Stable template key, unique within the pipeline
    pub task_key: String,
    pub role: AgentRoleId,
    /// Task uuids (same phase) that must be `completed` first
    pub dependencies: Vec<Uuid>,
    pub optional: bool,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub last_message: Option<String>,
    /// Invocation currently or most recently dispatched; also the charge key
    pub invocation_uuid: Option<Uuid>,
    /// Earliest time a failed task may be retried
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub artifact: Option<String>,
    pub cost: Cost,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        execution_uuid: Uuid,
        phase: usize,
        task_key: impl Into<String>,
        role: AgentRoleId,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_uuid: Uuid::new_v4(),
            execution_uuid,
            phase,
            task_key: task_key.into(),
            role,
            dependencies: Vec::new(),
            optional: false,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            last_message: None,
            invocation_uuid: None,
            next_attempt_at: None,
            artifact: None,
            cost: Cost::ZERO,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn is_required(&self) -> bool {
        !self.optional
    }

    pub fn has_exceeded_max_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn charge_key(&self) -> Option<ChargeKey> {
        self.invocation_uuid.map(ChargeKey)
    }

    /// Whether a failed task may be dispatched again at `now`
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Failed
            && !self.has_exceeded_max_attempts()
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
