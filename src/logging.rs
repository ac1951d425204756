//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestrator's async control
//! loops. Console output, human-readable by default or JSON lines when
//! configured.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::{ConfigManager, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    init_with_config(&LoggingConfig::default());
}

/// Initialize structured logging, honoring the `logging` configuration section
pub fn init_with_config(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = match (&config.level, std::env::var("RUST_LOG")) {
            (_, Ok(directive)) => EnvFilter::new(directive),
            (Some(level), Err(_)) => EnvFilter::new(level),
            (None, Err(_)) => EnvFilter::new(get_log_level(&environment)),
        };

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized; keeping it");
        }

        tracing::info!(
            environment = %environment,
            json = config.json,
            "Structured logging initialized"
        );
    });
}

/// Default filter directive for an environment name
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for execution operations
pub fn log_execution_operation(
    operation: &str,
    execution_uuid: Uuid,
    state: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_uuid = %execution_uuid,
        state = %state,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "EXECUTION_OPERATION"
    );
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    execution_uuid: Uuid,
    task_uuid: Uuid,
    task_key: &str,
    role: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_uuid = %execution_uuid,
        task_uuid = %task_uuid,
        task_key = %task_key,
        role = %role,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log structured data for gate operations
pub fn log_gate_operation(
    operation: &str,
    execution_uuid: Uuid,
    gate_uuid: Uuid,
    gate_name: &str,
    resolution: &str,
    actor: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_uuid = %execution_uuid,
        gate_uuid = %gate_uuid,
        gate_name = %gate_name,
        resolution = %resolution,
        actor = actor,
        timestamp = %Utc::now().to_rfc3339(),
        "GATE_OPERATION"
    );
}

/// Log structured data for budget operations
pub fn log_budget_operation(
    operation: &str,
    execution_uuid: Uuid,
    scope: Option<&str>,
    amount_micros: u64,
    status: &str,
) {
    tracing::info!(
        operation = %operation,
        execution_uuid = %execution_uuid,
        scope = scope,
        amount_micros = amount_micros,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "BUDGET_OPERATION"
    );
}

/// Log errors with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
