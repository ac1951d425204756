//! # Database Operations
//!
//! Dependency-injected storage for execution, task, gate and ledger records.
//!
//! ## Overview
//!
//! The orchestrator only talks to the [`ExecutionStore`] trait. Two
//! implementations ship with the crate:
//!
//! - [`InMemoryStore`] - `parking_lot`-guarded maps, for tests and embedded use
//! - [`PgExecutionStore`] - PostgreSQL through `sqlx` (`postgres` feature)
//!
//! ## Consistency Contract
//!
//! - Writes carrying a transition are compare-and-set on the prior state
//! - Ledger debits check and update spend in one atomic step
//! - A task completion and its debit are applied together or not at all

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgExecutionStore;
pub use store::{
    CeilingUpdate, ExecutionRecords, ExecutionStore, GateResolveOutcome, StoreError, StoreResult,
};
