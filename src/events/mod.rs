//! # Lifecycle Events
//!
//! Broadcast publication of execution, task, gate and budget lifecycle
//! events. Publishing never blocks the orchestrator; slow subscribers lag and
//! lose the oldest events instead.
//!
//! ```rust
//! use conductor_core::constants::events;
//! use conductor_core::events::EventPublisher;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let publisher = EventPublisher::new(16);
//! let mut receiver = publisher.subscribe();
//!
//! publisher
//!     .publish(events::GATE_OPENED, json!({ "gate_name": "design_review" }))
//!     .await
//!     .unwrap();
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.name, events::GATE_OPENED);
//! # });
//! ```

pub mod publisher;

pub use publisher::{EventPublisher, PublishError, PublishedEvent};
