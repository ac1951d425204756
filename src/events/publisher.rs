use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::system;

/// Fan-out of execution, task, gate and budget lifecycle events.
///
/// Delivery is best effort: slow subscribers lag and lose the oldest events,
/// and publishing with nobody listening is not an error. Consumers that need
/// the authoritative state read it back from the store.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl PublishedEvent {
    /// Execution the event belongs to, when the context carries one
    pub fn execution_uuid(&self) -> Option<Uuid> {
        self.context
            .get("execution_uuid")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Broadcast `context` under `event_name`; returns how many subscribers
    /// the event reached.
    ///
    /// The context must be a JSON object so subscribers can route on its
    /// `execution_uuid` field.
    pub async fn publish(
        &self,
        event_name: impl Into<String>,
        context: Value,
    ) -> Result<usize, PublishError> {
        let name = event_name.into();
        if !context.is_object() {
            return Err(PublishError::InvalidContext { event: name });
        }

        let event = PublishedEvent {
            name,
            context,
            published_at: Utc::now(),
        };
        Ok(self.sender.send(event).unwrap_or(0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    #[error("Context for event '{event}' is not a JSON object")]
    InvalidContext { event: String },
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(system::DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}
