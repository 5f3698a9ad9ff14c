//! Audit event bus.
//!
//! Registry mutations and circuit transitions are published on a Tokio
//! broadcast channel. Publishing never blocks and never fails the operation
//! that triggered it; with no subscribers the event is simply dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::router::CircuitStatus;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Everything the audit sink receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingEvent {
    ModelCreated {
        model_id: String,
        source: CreateSource,
        timestamp: DateTime<Utc>,
    },

    ModelUpdated {
        model_id: String,
        version: u64,
        admin_override: bool,
        timestamp: DateTime<Utc>,
    },

    ModelDeleted {
        model_id: String,
        timestamp: DateTime<Utc>,
    },

    CircuitTransition {
        model_id: String,
        from: CircuitStatus,
        to: CircuitStatus,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
}

impl RoutingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelCreated { .. } => "model_created",
            Self::ModelUpdated { .. } => "model_updated",
            Self::ModelDeleted { .. } => "model_deleted",
            Self::CircuitTransition { .. } => "circuit_transition",
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::ModelCreated { model_id, .. }
            | Self::ModelUpdated { model_id, .. }
            | Self::ModelDeleted { model_id, .. }
            | Self::CircuitTransition { model_id, .. } => model_id,
        }
    }
}

/// How a model entered the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum CreateSource {
    Direct,
    Template(String),
}

pub struct EventBus {
    sender: broadcast::Sender<RoutingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: RoutingEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward every event to the tracing audit target until the bus closes.
pub fn spawn_audit_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(
                        target: "routing::audit",
                        event_type = event.event_type(),
                        model_id = event.model_id(),
                        %payload,
                        "audit"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "routing::audit", skipped, "Audit logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
