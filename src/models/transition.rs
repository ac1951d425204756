//! Append-only transition history for executions and tasks.
//!
//! Stores assign `sort_key` and `created_at` when a `New*Transition` is
//! appended; the most recent entry always matches the entity's current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTransition {
    pub execution_uuid: Uuid,
    pub sort_key: i32,
    pub from_state: Option<String>,
    pub to_state: String,
    pub event: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecutionTransition {
    pub execution_uuid: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub event: String,
    pub metadata: Value,
}

impl NewExecutionTransition {
    pub fn into_transition(self, sort_key: i32) -> ExecutionTransition {
        ExecutionTransition {
            execution_uuid: self.execution_uuid,
            sort_key,
            from_state: self.from_state,
            to_state: self.to_state,
            event: self.event,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_uuid: Uuid,
    pub execution_uuid: Uuid,
    pub sort_key: i32,
    pub from_state: Option<String>,
    pub to_state: String,
    pub event: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskTransition {
    pub task_uuid: Uuid,
    pub execution_uuid: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub event: String,
    pub metadata: Value,
}

impl NewTaskTransition {
    pub fn into_transition(self, sort_key: i32) -> TaskTransition {
        TaskTransition {
            task_uuid: self.task_uuid,
            execution_uuid: self.execution_uuid,
            sort_key,
            from_state: self.from_state,
            to_state: self.to_state,
            event: self.event,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}
