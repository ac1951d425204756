use conductor_core::models::TaskRecord;
use conductor_core::registry::AgentRoleId;
use conductor_core::state_machine::TaskStatus;
use proptest::prelude::*;
use uuid::Uuid;

pub const MAX_ATTEMPTS: u32 = 3;

pub fn task_status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Running),
        Just(TaskStatus::Deploying),
        Just(TaskStatus::Testing),
        Just(TaskStatus::Passed),
        Just(TaskStatus::Committing),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
        Just(TaskStatus::Skipped),
        Just(TaskStatus::Blocked),
    ]
}

/// Stable task identifier for position `index` in a generated phase
pub fn task_uuid(index: usize) -> Uuid {
    Uuid::from_u128(index as u128 + 1)
}

type TaskShape = (TaskStatus, bool, u32, Vec<prop::sample::Index>);

/// One generated task: status, optional flag, attempts, and candidate dependency positions
fn task_shape_strategy() -> impl Strategy<Value = TaskShape> {
    (
        task_status_strategy(),
        any::<bool>(),
        0..=MAX_ATTEMPTS,
        prop::collection::vec(any::<prop::sample::Index>(), 0..3),
    )
}

/// A phase of up to 12 tasks whose dependencies only point at earlier tasks
pub fn phase_tasks_strategy() -> impl Strategy<Value = Vec<TaskRecord>> {
    prop::collection::vec(task_shape_strategy(), 1..12).prop_map(|shapes| {
        let execution_uuid = Uuid::from_u128(0xC0FFEE);
        shapes
            .into_iter()
            .enumerate()
            .map(|(index, (status, optional, attempts, deps))| {
                let mut task = TaskRecord::new(
                    execution_uuid,
                    0,
                    format!("task_{index}"),
                    AgentRoleId::from("backend_developer"),
                    MAX_ATTEMPTS,
                )
                .with_optional(optional);
                task.task_uuid = task_uuid(index);
                task.status = status;
                task.attempts = attempts;
                if index > 0 {
                    let mut dependencies: Vec<Uuid> =
                        deps.iter().map(|dep| task_uuid(dep.index(index))).collect();
                    dependencies.sort();
                    dependencies.dedup();
                    task.dependencies = dependencies;
                }
                task
            })
            .collect()
    })
}

/// Debit amounts in cents
pub fn debit_amounts_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..2_000, 1..40)
}
