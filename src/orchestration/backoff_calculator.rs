//! # Backoff Calculator
//!
//! Computes when a transiently failed task may be dispatched again.
//!
//! ## Overview
//!
//! Two sources feed the decision: the agent's own retry hint (for example a
//! rate limit's retry-after) and exponential backoff over the attempt count.
//! A server hint wins when present; both are capped at the configured maximum.
//! The result is stored on the task as `next_attempt_at`, so the delay
//! survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Exponential multiplier (default: 2.0)
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Maximum jitter percentage (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

/// Outcome of a backoff calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffResult {
    pub delay: Duration,
    pub backoff_type: BackoffType,
    pub next_retry_at: DateTime<Utc>,
}

/// Where the delay came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// The agent asked for a specific delay
    ServerRequested,
    /// Exponential backoff with optional jitter
    Exponential,
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Calculate the delay after `attempts` failed attempts (1-based)
    pub fn calculate(&self, attempts: u32, server_requested: Option<Duration>) -> BackoffResult {
        let (delay, backoff_type) = match server_requested {
            Some(requested) => (requested.min(self.config.max_delay), BackoffType::ServerRequested),
            None => (self.exponential_delay(attempts), BackoffType::Exponential),
        };

        BackoffResult {
            delay,
            backoff_type,
            next_retry_at: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    fn exponential_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.base_delay.as_millis() as f64;
        let max_ms = self.config.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.config.multiplier.powi(exponent)).min(max_ms);

        let mut delay_ms = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms as u64
        } else {
            0
        };
        if self.config.jitter_enabled {
            delay_ms = self.apply_jitter(delay_ms).min(max_ms as u64);
        }
        Duration::from_millis(delay_ms)
    }

    /// Apply jitter to delay to prevent thundering herd
    fn apply_jitter(&self, delay_ms: u64) -> u64 {
        use rand::Rng;

        let jitter_range = (delay_ms as f64 * self.config.max_jitter.clamp(0.0, 1.0)) as u64;
        if jitter_range == 0 {
            return delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range);

        if rng.gen_bool(0.5) {
            delay_ms.saturating_add(jitter)
        } else {
            delay_ms.saturating_sub(jitter)
        }
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffCalculatorConfig::default())
    }
}
