//! Agent event fan-out
//!
//! Engine operations publish named events with a JSON payload; external
//! surfaces (socket gateways, dashboards) subscribe and relay them. Events
//! for one agent are published from inside the coordinator's per-extension
//! critical sections, so per-agent ordering follows operation order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Well-known event names
pub mod kinds {
    pub const AGENT_PAUSED: &str = "agent:paused";
    pub const AGENT_UNPAUSED: &str = "agent:unpaused";
    pub const SPY_STARTED: &str = "spy:started";
    pub const SPY_STOPPED: &str = "spy:stopped";
    pub const TRANSFER_COMPLETED: &str = "transfer:completed";
    pub const TRANSFER_FAILED: &str = "transfer:failed";
}

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub event: String,
    pub extension: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast fan-out with consecutive-duplicate suppression
///
/// A repeat of the last payload for the same (extension, event) pair is
/// dropped; state dashboards only care about changes.
pub struct EventBroadcaster {
    tx: broadcast::Sender<AgentEvent>,
    last_payload: DashMap<(String, String), serde_json::Value>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            last_payload: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publish unless it duplicates the previous event for this agent+kind
    pub fn publish(&self, event: &str, extension: &str, payload: serde_json::Value) {
        let key = (extension.to_string(), event.to_string());
        let duplicate = self
            .last_payload
            .get(&key)
            .map(|last| *last == payload)
            .unwrap_or(false);
        if duplicate {
            tracing::trace!("Suppressing duplicate {} for {}", event, extension);
            return;
        }
        self.last_payload.insert(key, payload.clone());

        let envelope = AgentEvent {
            event: event.to_string(),
            extension: extension.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
    }
}
