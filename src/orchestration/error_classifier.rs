//! # Agent Error Classification
//!
//! Decides whether an agent failure is worth retrying.
//!
//! ## Overview
//!
//! Workers report failures as [`AgentError`]s. The classifier maps each one to
//! an [`ErrorClassification`]: transient failures (timeouts, rate limits,
//! network and availability problems) are retried with backoff while attempts
//! remain; everything else is permanent and blocks the task immediately.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ AgentError      │────▶│ ErrorClassifier │────▶│ Classification  │
//! │ + Context       │     │ Strategy        │     │ Result          │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::gateway::AgentError;
use crate::constants::sanitize_error_detail;
use crate::registry::AgentRoleId;

/// Context information for error classification
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub task_uuid: Uuid,
    pub task_key: String,
    pub role: AgentRoleId,
    /// Current attempt number (1-based)
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// How long the invocation ran before failing
    pub execution_duration: Duration,
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_category: ErrorCategory,
    pub is_retryable: bool,
    /// Delay the agent asked for, if any
    pub retry_delay: Option<Duration>,
    /// Specific error code for tracking
    pub error_code: String,
    /// Sanitized, human-readable message
    pub error_message: String,
    pub is_final_attempt: bool,
}

/// Primary error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Permanent error - will never succeed if retried
    Permanent,
    /// Transient error - may succeed on retry
    Transient,
    /// The invocation exceeded its class timeout
    Timeout,
    /// The agent provider throttled the call
    RateLimit,
    /// Connectivity failure between the orchestrator and the agent
    Network,
    /// The request itself was rejected as invalid
    Validation,
    /// The orchestration was cancelled while the invocation ran
    Cancelled,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Permanent => write!(f, "Permanent"),
            ErrorCategory::Transient => write!(f, "Transient"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::RateLimit => write!(f, "RateLimit"),
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Validation => write!(f, "Validation"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Strategy trait for classifying agent failures
pub trait ErrorClassifier: Send + Sync {
    fn classify_error(&self, error: &AgentError, context: &ErrorContext) -> ErrorClassification;

    fn classifier_name(&self) -> &'static str;
}

/// Default classification table
#[derive(Debug, Clone, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    fn category_for(error: &AgentError) -> (ErrorCategory, &'static str) {
        match error {
            AgentError::Timeout { .. } => (ErrorCategory::Timeout, "AGENT_TIMEOUT"),
            AgentError::RateLimited { .. } => (ErrorCategory::RateLimit, "AGENT_RATE_LIMITED"),
            AgentError::Network(_) => (ErrorCategory::Network, "AGENT_NETWORK"),
            AgentError::Unavailable(_) => (ErrorCategory::Transient, "AGENT_UNAVAILABLE"),
            AgentError::Cancelled => (ErrorCategory::Cancelled, "AGENT_CANCELLED"),
            AgentError::InvalidInput(_) => (ErrorCategory::Validation, "AGENT_INVALID_INPUT"),
            AgentError::Unsupported(_) => (ErrorCategory::Permanent, "AGENT_UNSUPPORTED"),
            AgentError::Internal(_) => (ErrorCategory::Permanent, "AGENT_INTERNAL"),
        }
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_error(&self, error: &AgentError, context: &ErrorContext) -> ErrorClassification {
        let (error_category, error_code) = Self::category_for(error);
        let is_retryable = matches!(
            error_category,
            ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Transient
                | ErrorCategory::Cancelled
        );
        let retry_delay = match error {
            AgentError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };

        ErrorClassification {
            error_category,
            is_retryable,
            retry_delay,
            error_code: error_code.to_string(),
            error_message: sanitize_error_detail(&error.to_string()),
            is_final_attempt: context.attempt_number >= context.max_attempts,
        }
    }

    fn classifier_name(&self) -> &'static str {
        "StandardErrorClassifier"
    }
}
