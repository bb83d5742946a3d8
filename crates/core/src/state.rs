//! Plugin lifecycle state machine.

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PalisadeError, Result};

/// Maximum number of transitions remembered per plugin.
const HISTORY_CAPACITY: usize = 32;

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Ready,
    Running,
    Reloading,
    Restarting,
    Unloading,
    Failed,
}

impl PluginState {
    /// Returns the lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Reloading => "reloading",
            Self::Restarting => "restarting",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        }
    }

    /// Whether the transition `self -> next` is allowed.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Ready)
                | (Loading, Failed)
                | (Ready, Running)
                | (Ready, Reloading)
                | (Ready, Unloading)
                | (Ready, Failed)
                | (Running, Reloading)
                | (Running, Restarting)
                | (Running, Unloading)
                | (Running, Failed)
                | (Reloading, Running)
                | (Reloading, Failed)
                | (Restarting, Running)
                | (Restarting, Failed)
                | (Unloading, Unloaded)
                | (Failed, Loading)
                | (Failed, Reloading)
                | (Failed, Unloading)
        )
    }

    /// Whether calls can be dispatched to a plugin in this state.
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub at: SystemTime,
}

/// Tracks the current state of one plugin and refuses illegal moves.
#[derive(Debug, Clone)]
pub struct StateMachine {
    plugin: String,
    state: PluginState,
    history: VecDeque<StateTransition>,
}

impl StateMachine {
    /// Creates a state machine in the `Unloaded` state.
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            state: PluginState::Unloaded,
            history: VecDeque::new(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Moves to `next`, or fails with `InvalidTransition` leaving the state untouched.
    pub fn transition(&mut self, next: PluginState) -> Result<PluginState> {
        if !self.state.can_transition_to(next) {
            return Err(PalisadeError::InvalidTransition {
                plugin: self.plugin.clone(),
                from: self.state,
                to: next,
            });
        }

        let previous = self.state;
        self.state = next;
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from: previous,
            to: next,
            at: SystemTime::now(),
        });
        debug!(plugin = %self.plugin, from = %previous, to = %next, "state transition");
        Ok(previous)
    }

    /// Moves to `next` only if currently in `expected`.
    pub fn transition_from(&mut self, expected: PluginState, next: PluginState) -> Result<bool> {
        if self.state != expected {
            return Ok(false);
        }
        self.transition(next).map(|_| true)
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }
}
