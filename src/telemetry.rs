//! Structured event sink for supervisor and worker lifecycle events.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Receives `(component, component id, event, payload)` tuples.
pub trait LogSink: Send + Sync {
    fn record(&self, component: &str, id: &str, event: &str, payload: Value);
}

/// Default sink: one `tracing` event per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, component: &str, id: &str, event: &str, payload: Value) {
        tracing::info!(component, id, event, payload = %payload, "event");
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub component: String,
    pub id: String,
    pub event: String,
    pub payload: Value,
}

/// Sink that keeps every event in memory, for inspection in tests and tools.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Names of recorded events, in order.
    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.event == event).count()
    }
}

impl LogSink for MemorySink {
    fn record(&self, component: &str, id: &str, event: &str, payload: Value) {
        let event = Event {
            component: component.to_string(),
            id: id.to_string(),
            event: event.to_string(),
            payload,
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
