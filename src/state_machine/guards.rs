use std::collections::HashMap;
use uuid::Uuid;

use super::errors::{business_rule_violation, dependencies_not_met, GuardError, GuardResult};
use super::states::TaskStatus;
use crate::models::TaskRecord;

/// Current status of every task a guard may need to look at, keyed by task uuid
pub type DependencyStatuses = HashMap<Uuid, TaskStatus>;

/// Trait for implementing state transition guards
pub trait StateGuard<T> {
    /// Check if a transition is allowed
    fn check(&self, entity: &T, statuses: &DependencyStatuses) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard to check that every dependency is `completed` before a task runs
pub struct TaskDependenciesMetGuard;

impl StateGuard<TaskRecord> for TaskDependenciesMetGuard {
    fn check(&self, task: &TaskRecord, statuses: &DependencyStatuses) -> GuardResult<()> {
        let unmet: Vec<String> = task
            .dependencies
            .iter()
            .filter_map(|dependency| match statuses.get(dependency) {
                Some(status) if status.satisfies_dependencies() => None,
                Some(status) => Some(format!("{dependency} is {status}")),
                None => Some(format!("{dependency} is unknown")),
            })
            .collect();

        if unmet.is_empty() {
            Ok(())
        } else {
            Err(dependencies_not_met(format!(
                "Task {} ({}) has unmet dependencies: {}",
                task.task_uuid,
                task.task_key,
                unmet.join(", ")
            )))
        }
    }

    fn description(&self) -> &'static str {
        "All task dependencies must be completed"
    }
}

/// Guard to check a failed task still has attempts left
pub struct TaskCanBeRetriedGuard;

impl StateGuard<TaskRecord> for TaskCanBeRetriedGuard {
    fn check(&self, task: &TaskRecord, _statuses: &DependencyStatuses) -> GuardResult<()> {
        if task.has_exceeded_max_attempts() {
            return Err(GuardError::AttemptsExhausted {
                attempts: task.attempts,
                max_attempts: task.max_attempts,
            });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Task must have retry attempts remaining"
    }
}

/// Guard to check a failed task really has no attempts left before it is blocked
pub struct TaskAttemptsExhaustedGuard;

impl StateGuard<TaskRecord> for TaskAttemptsExhaustedGuard {
    fn check(&self, task: &TaskRecord, _statuses: &DependencyStatuses) -> GuardResult<()> {
        if task.has_exceeded_max_attempts() {
            Ok(())
        } else {
            Err(business_rule_violation(format!(
                "Task {} still has {} of {} attempts left",
                task.task_key,
                task.max_attempts - task.attempts,
                task.max_attempts
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Task must have exhausted its attempts"
    }
}

/// Guard to check only optional tasks are skipped
pub struct TaskIsOptionalGuard;

impl StateGuard<TaskRecord> for TaskIsOptionalGuard {
    fn check(&self, task: &TaskRecord, _statuses: &DependencyStatuses) -> GuardResult<()> {
        if task.optional {
            Ok(())
        } else {
            Err(business_rule_violation(format!(
                "Task {} is required and cannot be skipped",
                task.task_key
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Only optional tasks may be skipped"
    }
}
