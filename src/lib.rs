#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conductor Core
//!
//! Execution orchestrator for multi-agent delivery pipelines.
//!
//! ## Overview
//!
//! A project is delivered by an ordered pipeline of phases (requirements,
//! design, implementation). Each phase holds tasks performed by external
//! agent workers, with dependency edges between tasks of the same phase.
//! Conductor Core drives an execution through the pipeline: it dispatches
//! ready tasks, retries transient failures with backoff, enforces spend
//! ceilings, suspends at human review gates and reports progress.
//!
//! ## Module Organization
//!
//! - [`models`] - Persisted value objects (executions, tasks, gates, ledgers)
//! - [`database`] - The [`database::ExecutionStore`] trait with in-memory and PostgreSQL backends
//! - [`state_machine`] - Execution and task state machines
//! - [`registry`] - Typed role registry and pipeline definitions
//! - [`orchestration`] - Runners, gateway, budget guard, gates and progress
//! - [`config`] - Configuration loading and validation
//! - [`events`] - Lifecycle event broadcasting
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conductor_core::config::ConductorConfig;
//! use conductor_core::database::InMemoryStore;
//! use conductor_core::orchestration::{Orchestrator, StartExecutionRequest};
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let orchestrator = Orchestrator::new(ConductorConfig::default(), store)?;
//! // Register one worker per role with `orchestrator.register_worker(..)`, then:
//! let execution_uuid = orchestrator
//!     .start(StartExecutionRequest::new(
//!         Uuid::new_v4(),
//!         ["requirements_analyst", "solution_architect", "backend_developer"],
//!     ))
//!     .await?;
//! let progress = orchestrator.progress(execution_uuid).await?;
//! println!("{}: {}%", progress.execution_state, progress.overall_progress);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::{ConductorConfig, ConfigManager, ConfigurationError};
pub use constants::events as system_events;
pub use constants::{status_groups, system};
pub use database::{ExecutionStore, InMemoryStore, StoreError};
pub use error::{ConductorError, Result};
pub use events::{EventPublisher, PublishedEvent};
pub use models::{BudgetCeilings, Cost, Execution, FailureReason, Gate, TaskRecord};
pub use orchestration::{
    AgentError, AgentOutput, AgentRequest, AgentWorker, GateResolutionRequest, InvocationContext,
    OrchestrationError, Orchestrator, ProgressSnapshot, StartExecutionRequest,
};
pub use registry::{AgentRoleId, PipelineDefinition, RoleRegistry};
pub use state_machine::{ExecutionState, TaskStatus};
