//! # System Constants
//!
//! Defaults, lifecycle event names and status groupings shared across the
//! orchestrator.

use crate::state_machine::TaskStatus;

/// System-wide defaults used when no configuration overrides them
pub mod system {
    /// Default per-execution limit on concurrently running agent invocations
    pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;
    /// Default attempt ceiling for transient task failures
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default capacity of each execution runner's command mailbox
    pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = 64;
    /// Default capacity of the lifecycle event broadcast channel
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;
    /// Maximum characters of error detail persisted on a task
    pub const MAX_ERROR_DETAIL_CHARS: usize = 512;
    /// Maximum characters of a worker progress message persisted on a task
    pub const MAX_MESSAGE_CHARS: usize = 256;
    /// Reason recorded when a spend is rejected by the budget guard
    pub const BUDGET_EXCEEDED_REASON: &str = "budget exceeded";
    /// Error recorded on tasks found `running` without an invocation after restart
    pub const ORPHANED_INVOCATION_REASON: &str =
        "invocation lost during restart; reconciled as transient failure";
    /// Actor recorded on a gate closed because its execution was cancelled
    pub const CANCEL_GATE_ACTOR: &str = "system:cancel";
    pub const CANCEL_GATE_NOTES: &str = "execution cancelled while awaiting review";
}

/// Lifecycle event names published on the [`crate::events::EventPublisher`]
pub mod events {
    pub const EXECUTION_STATE_CHANGED: &str = "execution.state_changed";
    pub const EXECUTION_PAUSED: &str = "execution.paused";
    pub const EXECUTION_RESUMED: &str = "execution.resumed";
    pub const TASK_STATE_CHANGED: &str = "task.state_changed";
    pub const GATE_OPENED: &str = "gate.opened";
    pub const GATE_RESOLVED: &str = "gate.resolved";
    pub const BUDGET_REJECTED: &str = "budget.rejected";
    pub const BUDGET_COMMITTED: &str = "budget.committed";
}

/// Groupings of task statuses used by dependency resolution and progress
pub mod status_groups {
    use super::TaskStatus;

    /// Statuses that indicate an agent invocation is in flight
    pub const ACTIVE_STATUSES: &[TaskStatus] = &[
        TaskStatus::Running,
        TaskStatus::Deploying,
        TaskStatus::Testing,
        TaskStatus::Passed,
        TaskStatus::Committing,
    ];

    /// Statuses that count as done for phase completion
    pub const FINISHED_STATUSES: &[TaskStatus] = &[TaskStatus::Completed, TaskStatus::Skipped];

    /// Statuses an operator retry resets back to pending
    pub const RETRYABLE_STATUSES: &[TaskStatus] = &[TaskStatus::Failed, TaskStatus::Blocked];
}

/// Sanitize an error message for persistence and external display.
///
/// Keeps the leading message lines, drops anything that looks like a stack
/// trace, and truncates to [`system::MAX_ERROR_DETAIL_CHARS`].
pub fn sanitize_error_detail(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .take_while(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("stack backtrace")
                || trimmed.starts_with("Stack backtrace")
                || trimmed.starts_with("at ")
                || trimmed.starts_with("Traceback")
                || (trimmed.len() > 2
                    && trimmed.as_bytes()[0].is_ascii_digit()
                    && trimmed.contains(": ")
                    && trimmed.contains("::")))
        })
        .filter(|line| !line.is_empty())
        .collect();

    truncate_chars(&kept.join(" "), system::MAX_ERROR_DETAIL_CHARS)
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
