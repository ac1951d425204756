//! # Conductor Configuration System
//!
//! Typed configuration for the orchestrator. Every section has defaults, so an
//! empty configuration is valid; files and environment variables override
//! individual values.
//!
//! ## Sources
//!
//! Loaded in order, later sources win:
//!
//! 1. Built-in defaults
//! 2. `config/conductor.toml`
//! 3. `config/conductor.<environment>.toml`
//! 4. `CONDUCTOR__<SECTION>__<FIELD>` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conductor_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let limit = manager.config().execution.max_concurrent_tasks;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::system;
use crate::models::{BudgetCeilings, Cost};
use crate::orchestration::backoff_calculator::BackoffCalculatorConfig;
use crate::registry::InvocationClass;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub budget: BudgetConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

/// Per-execution control loop settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on agent invocations in flight for one execution
    pub max_concurrent_tasks: usize,
    /// Capacity of each execution runner's command mailbox
    pub command_buffer_size: usize,
    /// How a `revise` gate decision resets the phase
    pub revision_policy: RevisionPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: system::DEFAULT_MAX_CONCURRENT_TASKS,
            command_buffer_size: system::DEFAULT_COMMAND_BUFFER_SIZE,
            revision_policy: RevisionPolicy::default(),
        }
    }
}

/// Which tasks of a phase go back to `pending` on a `revise` decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionPolicy {
    /// Tasks flagged by the approver plus failed, blocked and skipped tasks
    #[default]
    Targeted,
    /// Every task of the phase
    FullReplay,
}

/// Retry ceiling and backoff curve for transient task failures
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the computed delay
    pub max_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: system::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff_config(&self) -> BackoffCalculatorConfig {
        BackoffCalculatorConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_enabled: self.jitter_enabled,
            max_jitter: self.max_jitter,
        }
    }
}

/// Invocation timeouts per invocation class, in seconds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub standard: u64,
    pub long_running: u64,
    pub build: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            standard: 300,
            long_running: 900,
            build: 1_800,
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: InvocationClass) -> Duration {
        let seconds = match class {
            InvocationClass::Standard => self.standard,
            InvocationClass::LongRunning => self.long_running,
            InvocationClass::Build => self.build,
        };
        Duration::from_secs(seconds)
    }
}

/// Default spend ceilings, in dollars
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub default_execution_ceiling: f64,
    pub default_project_ceiling: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_execution_ceiling: 50.0,
            default_project_ceiling: 500.0,
        }
    }
}

impl BudgetConfig {
    pub fn default_ceilings(&self) -> BudgetCeilings {
        BudgetCeilings {
            execution: Cost::from_dollars(self.default_execution_ceiling),
            project: Cost::from_dollars(self.default_project_ceiling),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: system::DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter directive overriding the environment default
    pub level: Option<String>,
}

impl ConductorConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.execution.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_tasks",
                0,
                "concurrency limit must be greater than 0",
            ));
        }

        if self.execution.command_buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.command_buffer_size",
                0,
                "command buffer must hold at least one command",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                0,
                "at least one attempt is required",
            ));
        }

        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigurationError::invalid_value(
                "retry.multiplier",
                self.retry.multiplier,
                "multiplier must be a finite number >= 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.max_jitter) {
            return Err(ConfigurationError::invalid_value(
                "retry.max_jitter",
                self.retry.max_jitter,
                "jitter must be between 0.0 and 1.0",
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.base_delay_ms",
                self.retry.base_delay_ms,
                format!(
                    "base delay exceeds max delay of {}ms",
                    self.retry.max_delay_ms
                ),
            ));
        }

        for (field, seconds) in [
            ("timeouts.standard", self.timeouts.standard),
            ("timeouts.long_running", self.timeouts.long_running),
            ("timeouts.build", self.timeouts.build),
        ] {
            if seconds == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    seconds,
                    "timeout must be greater than 0",
                ));
            }
        }

        for (field, dollars) in [
            (
                "budget.default_execution_ceiling",
                self.budget.default_execution_ceiling,
            ),
            (
                "budget.default_project_ceiling",
                self.budget.default_project_ceiling,
            ),
        ] {
            if !dollars.is_finite() || dollars < 0.0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    dollars,
                    "ceiling must be a non-negative amount",
                ));
            }
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "event channel capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}
