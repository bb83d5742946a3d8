//! Broadcast bus for runtime events.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::state::PluginState;

const DEFAULT_CAPACITY: usize = 256;

/// Something that happened to a plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    StateChanged {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },
    Crashed {
        plugin: String,
        reason: String,
    },
    Restarted {
        plugin: String,
        attempt: u32,
    },
    ServicesFlushed {
        plugin: String,
        keys: Vec<String>,
    },
    /// Published by plugins themselves.
    Custom {
        plugin: String,
        topic: String,
        data: Value,
    },
}

impl PluginEvent {
    pub fn plugin(&self) -> &str {
        match self {
            Self::StateChanged { plugin, .. }
            | Self::Crashed { plugin, .. }
            | Self::Restarted { plugin, .. }
            | Self::ServicesFlushed { plugin, .. }
            | Self::Custom { plugin, .. } => plugin,
        }
    }
}

/// Fan-out event channel. Slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event, returning how many subscribers received it.
    pub fn publish(&self, event: PluginEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }
}
