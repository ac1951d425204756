//! # Task Graph
//!
//! Dependency view over the tasks of one phase.
//!
//! The graph is rebuilt from persisted task records on every runner tick, so
//! it never holds state of its own. It answers the questions the runner asks
//! before dispatching: which tasks are ready, which retries are due, which
//! tasks can never run because a dependency is blocked, and whether the phase
//! is complete.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::models::TaskRecord;
use crate::state_machine::{DependencyStatuses, TaskStatus};

/// Whether a phase can be closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseCompletion {
    /// Every required task finished and no optional task is still in play
    Complete,
    /// Work remains that may still finish
    Incomplete { remaining: usize },
    /// A required task is blocked; the phase can never complete on its own
    Stalled { blockers: Vec<Uuid> },
}

/// A task that can never run, and the dependency responsible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreachableTask {
    pub task_uuid: Uuid,
    pub blocked_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct TaskGraph<'a> {
    tasks: Vec<&'a TaskRecord>,
    by_uuid: HashMap<Uuid, &'a TaskRecord>,
}

impl<'a> TaskGraph<'a> {
    pub fn new(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let tasks: Vec<&'a TaskRecord> = tasks.into_iter().collect();
        let by_uuid = tasks.iter().map(|task| (task.task_uuid, *task)).collect();
        Self { tasks, by_uuid }
    }

    /// Graph over the tasks belonging to `phase`
    pub fn for_phase(tasks: &'a [TaskRecord], phase: usize) -> Self {
        Self::new(tasks.iter().filter(|task| task.phase == phase))
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn get(&self, task_uuid: Uuid) -> Option<&'a TaskRecord> {
        self.by_uuid.get(&task_uuid).copied()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &'a TaskRecord> + '_ {
        self.tasks.iter().copied()
    }

    pub fn statuses(&self) -> DependencyStatuses {
        self.tasks
            .iter()
            .map(|task| (task.task_uuid, task.status))
            .collect()
    }

    pub fn dependencies_met(&self, task: &TaskRecord) -> bool {
        task.dependencies.iter().all(|dep| {
            self.by_uuid
                .get(dep)
                .is_some_and(|dep| dep.status.satisfies_dependencies())
        })
    }

    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.status.is_active()).count()
    }

    /// Tasks that may be dispatched at `now`, in dependency order
    pub fn ready_tasks(&self, now: DateTime<Utc>) -> Vec<&'a TaskRecord> {
        self.topological_order()
            .into_iter()
            .filter_map(|uuid| self.get(uuid))
            .filter(|task| match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Failed => task.is_retry_due(now),
                _ => false,
            })
            .filter(|task| self.dependencies_met(task))
            .collect()
    }

    /// Earliest backoff deadline among failed tasks that still have attempts left
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed && !task.has_exceeded_max_attempts())
            .filter_map(|task| task.next_attempt_at)
            .min()
    }

    /// Failed tasks with no attempts left
    pub fn exhausted_tasks(&self) -> Vec<&'a TaskRecord> {
        self.tasks
            .iter()
            .copied()
            .filter(|task| task.status == TaskStatus::Failed && task.has_exceeded_max_attempts())
            .collect()
    }

    /// Waiting tasks that depend, directly or transitively, on a task that
    /// will never complete (`blocked` or `skipped`)
    pub fn unreachable_tasks(&self) -> Vec<UnreachableTask> {
        let mut dead: HashMap<Uuid, Uuid> = HashMap::new();
        for uuid in self.topological_order() {
            let Some(task) = self.get(uuid) else { continue };
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Failed) {
                continue;
            }
            let blocker = task.dependencies.iter().copied().find(|dep| {
                dead.contains_key(dep)
                    || self.get(*dep).is_some_and(|dep| {
                        matches!(dep.status, TaskStatus::Blocked | TaskStatus::Skipped)
                    })
            });
            if let Some(blocker) = blocker {
                dead.insert(uuid, blocker);
            }
        }

        self.topological_order()
            .into_iter()
            .filter_map(|uuid| {
                dead.get(&uuid).map(|blocked_by| UnreachableTask {
                    task_uuid: uuid,
                    blocked_by: *blocked_by,
                })
            })
            .collect()
    }

    pub fn evaluate_completion(&self) -> PhaseCompletion {
        let blockers: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|task| task.is_required())
            .filter(|task| {
                task.status == TaskStatus::Blocked
                    || (task.status == TaskStatus::Failed && task.has_exceeded_max_attempts())
            })
            .map(|task| task.task_uuid)
            .collect();
        if !blockers.is_empty() {
            return PhaseCompletion::Stalled { blockers };
        }

        let remaining = self
            .tasks
            .iter()
            .filter(|task| {
                if task.is_required() {
                    !matches!(task.status, TaskStatus::Completed | TaskStatus::Skipped)
                } else {
                    task.status == TaskStatus::Pending
                        || task.status.is_active()
                        || (task.status == TaskStatus::Failed && !task.has_exceeded_max_attempts())
                }
            })
            .count();

        if remaining == 0 {
            PhaseCompletion::Complete
        } else {
            PhaseCompletion::Incomplete { remaining }
        }
    }

    /// Kahn's algorithm over in-phase dependencies, ties broken by insertion order
    pub fn topological_order(&self) -> Vec<Uuid> {
        let position: HashMap<Uuid, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (task.task_uuid, index))
            .collect();

        let mut unmet: Vec<usize> = vec![0; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (index, task) in self.tasks.iter().enumerate() {
            let deps: HashSet<&Uuid> = task.dependencies.iter().collect();
            for dep in deps {
                if let Some(&dep_index) = position.get(dep) {
                    unmet[index] += 1;
                    dependents[dep_index].push(index);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|index| unmet[*index] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(index) = queue.pop_front() {
            order.push(self.tasks[index].task_uuid);
            for &dependent in &dependents[index] {
                unmet[dependent] -= 1;
                if unmet[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        // Cycles are rejected at pipeline validation; keep any leftovers reachable
        if order.len() < self.tasks.len() {
            let seen: HashSet<Uuid> = order.iter().copied().collect();
            order.extend(
                self.tasks
                    .iter()
                    .map(|task| task.task_uuid)
                    .filter(|uuid| !seen.contains(uuid)),
            );
        }
        order
    }
}
