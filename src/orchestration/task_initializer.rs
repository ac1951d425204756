//! # Task Initializer
//!
//! Instantiates a phase's tasks when the execution first enters the phase.
//!
//! Only templates whose role is part of the execution's selection become
//! tasks. Dependency edges pointing at templates that were left out are
//! dropped, so an optional role being deselected never strands its
//! dependents. Instantiation is idempotent: a phase that already has tasks
//! is returned as-is.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::database::ExecutionStore;
use crate::models::{Execution, TaskRecord};
use crate::registry::{PipelineDefinition, RoleRegistry};

#[derive(Debug, Clone)]
pub struct TaskInitializer {
    registry: Arc<RoleRegistry>,
    pipeline: Arc<PipelineDefinition>,
    default_max_attempts: u32,
}

impl TaskInitializer {
    pub fn new(
        registry: Arc<RoleRegistry>,
        pipeline: Arc<PipelineDefinition>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            pipeline,
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    /// Build, without persisting, the task records for one phase
    pub fn build_phase_tasks(
        &self,
        execution: &Execution,
        phase_index: usize,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        let phase = self.pipeline.phase(phase_index).ok_or_else(|| {
            OrchestrationError::InvalidPipeline(format!(
                "phase index {phase_index} out of range for pipeline '{}'",
                self.pipeline.name
            ))
        })?;

        let mut tasks: Vec<TaskRecord> = Vec::new();
        let mut uuid_by_key = HashMap::new();
        for template in phase
            .tasks
            .iter()
            .filter(|template| execution.has_role(&template.role))
        {
            let max_attempts = self
                .registry
                .get(&template.role)
                .and_then(|role| role.max_attempts)
                .unwrap_or(self.default_max_attempts)
                .max(1);
            let task = TaskRecord::new(
                execution.execution_uuid,
                phase_index,
                template.key.clone(),
                template.role.clone(),
                max_attempts,
            )
            .with_optional(template.optional);
            uuid_by_key.insert(template.key.as_str(), task.task_uuid);
            tasks.push(task);
        }

        for task in &mut tasks {
            if let Some(template) = phase.template(&task.task_key) {
                task.dependencies = template
                    .depends_on
                    .iter()
                    .filter_map(|key| uuid_by_key.get(key.as_str()).copied())
                    .collect();
            }
        }

        Ok(tasks)
    }

    /// Return the phase's tasks, creating them on first entry
    pub async fn ensure_phase_tasks(
        &self,
        store: &Arc<dyn ExecutionStore>,
        execution: &Execution,
        phase_index: usize,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        let existing: Vec<TaskRecord> = store
            .list_tasks(execution.execution_uuid)
            .await?
            .into_iter()
            .filter(|task| task.phase == phase_index)
            .collect();
        if !existing.is_empty() {
            return Ok(existing);
        }

        let tasks = self.build_phase_tasks(execution, phase_index)?;
        if !tasks.is_empty() {
            store.insert_tasks(&tasks).await?;
        }
        info!(
            execution_uuid = %execution.execution_uuid,
            phase = phase_index + 1,
            task_count = tasks.len(),
            "Instantiated phase tasks"
        );
        Ok(tasks)
    }
}
