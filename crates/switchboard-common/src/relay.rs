//! Event relay
//!
//! Handlers and the dispatcher publish loose, named notifications through an
//! [`EventSink`]. Inside an isolation boundary the sink forwards events over
//! the boundary channel; on the bus side an [`EventRelay`] fans them out to
//! local subscribers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A named notification with a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Event name, e.g. `"handler.failed"`
    pub name: String,
    /// Who published it (handler type name or subsystem)
    pub source: String,
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl RelayEvent {
    pub fn new(name: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            name: name.into(),
            source: source.into(),
            data,
            timestamp,
        }
    }
}

/// Anything that accepts events. Posting never blocks and never fails.
pub trait EventSink: Send + Sync {
    fn post(&self, event: RelayEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn post(&self, _event: RelayEvent) {}
}

/// Broadcast fan-out of [`RelayEvent`]s.
#[derive(Clone)]
pub struct EventRelay {
    sender: broadcast::Sender<RelayEvent>,
}

impl EventRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: RelayEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventRelay {
    fn post(&self, event: RelayEvent) {
        self.publish(event);
    }
}
