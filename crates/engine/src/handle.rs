//! Live plugin handles.

use std::sync::Arc;
use std::time::Instant;

use palisade_core::{
    EventBus, ExecutionMode, PalisadeError, PluginEvent, PluginManifest, PluginState, Result,
    Services, StateMachine, StateTransition,
};
use palisade_plugin::RouterHandle;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::lifecycle::TrustedPlugin;
use crate::sandbox::{SandboxState, SandboxSupervisor};

/// State machine of one plugin, shared between its handle and its sandbox.
/// Every transition is published on the event bus.
#[derive(Clone)]
pub struct StateCell {
    machine: Arc<Mutex<StateMachine>>,
    events: EventBus,
}

impl StateCell {
    pub fn new(plugin: impl Into<String>, events: EventBus) -> Self {
        Self {
            machine: Arc::new(Mutex::new(StateMachine::new(plugin))),
            events,
        }
    }

    pub fn current(&self) -> PluginState {
        self.machine.lock().state()
    }

    /// Moves to `next`, failing on an illegal transition.
    pub fn advance(&self, next: PluginState) -> Result<()> {
        let (plugin, from) = {
            let mut machine = self.machine.lock();
            let from = machine.transition(next)?;
            (machine.plugin().to_string(), from)
        };
        self.events.publish(PluginEvent::StateChanged {
            plugin,
            from,
            to: next,
        });
        Ok(())
    }

    /// Like [`StateCell::advance`], ignoring illegal transitions.
    pub fn advance_lenient(&self, next: PluginState) {
        if let Err(e) = self.advance(next) {
            debug!(error = %e, "state transition skipped");
        }
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.machine.lock().history().cloned().collect()
    }
}

/// Execution strategy behind a handle.
pub enum PluginRuntime {
    Trusted(TrustedPlugin),
    Sandboxed(SandboxSupervisor),
}

impl PluginRuntime {
    async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        match self {
            Self::Trusted(plugin) => plugin.call(action, payload).await,
            Self::Sandboxed(sandbox) => sandbox.call(action, payload).await,
        }
    }
}

/// Status row reported by [`crate::Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub mode: ExecutionMode,
    pub state: PluginState,
    pub sandbox_state: Option<SandboxState>,
    pub uptime_seconds: f64,
    pub restarts: u32,
    pub pid: Option<u32>,
    pub memory_mb: Option<u64>,
    pub last_error: Option<String>,
}

impl PluginStatus {
    /// Row for a plugin that never became active.
    pub fn failed(manifest: &PluginManifest, error: impl Into<String>) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            mode: manifest.execution_mode,
            state: PluginState::Failed,
            sandbox_state: None,
            uptime_seconds: 0.0,
            restarts: 0,
            pid: None,
            memory_mb: None,
            last_error: Some(error.into()),
        }
    }
}

/// A loaded plugin.
pub struct PluginHandle {
    name: String,
    manifest: RwLock<PluginManifest>,
    runtime: tokio::sync::RwLock<Option<PluginRuntime>>,
    state: StateCell,
    activated_at: Mutex<Instant>,
    last_error: Mutex<Option<String>>,
}

impl PluginHandle {
    pub fn new(manifest: PluginManifest, runtime: PluginRuntime, state: StateCell) -> Self {
        Self {
            name: manifest.name.clone(),
            manifest: RwLock::new(manifest),
            runtime: tokio::sync::RwLock::new(Some(runtime)),
            state,
            activated_at: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> PluginManifest {
        self.manifest.read().clone()
    }

    pub fn state(&self) -> PluginState {
        self.state.current()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Dispatches a call to the runtime.
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        match self.state() {
            state if state.accepts_calls() => {}
            PluginState::Restarting | PluginState::Reloading => {
                return Err(PalisadeError::Restarting(self.name.clone()));
            }
            other => {
                return Err(PalisadeError::Unavailable {
                    plugin: self.name.clone(),
                    reason: format!("plugin is {other}"),
                });
            }
        }

        let runtime = self.runtime.read().await;
        let Some(runtime) = runtime.as_ref() else {
            return Err(PalisadeError::Unavailable {
                plugin: self.name.clone(),
                reason: "plugin has no runtime".to_string(),
            });
        };
        runtime.call(action, payload).await
    }

    /// Services exposed by a trusted instance. Sandboxes expose none.
    pub async fn services(&self) -> Services {
        match self.runtime.read().await.as_ref() {
            Some(PluginRuntime::Trusted(plugin)) => plugin.services(),
            _ => Services::new(),
        }
    }

    pub async fn router(&self) -> Option<RouterHandle> {
        match self.runtime.read().await.as_ref() {
            Some(PluginRuntime::Trusted(plugin)) => plugin.router(),
            _ => None,
        }
    }

    /// Takes the runtime out for replacement, waiting for in-flight calls.
    pub(crate) async fn take_runtime(&self) -> Option<PluginRuntime> {
        self.runtime.write().await.take()
    }

    /// Installs a fresh runtime and restarts the uptime clock.
    pub(crate) async fn install(&self, manifest: PluginManifest, runtime: PluginRuntime) {
        *self.runtime.write().await = Some(runtime);
        *self.manifest.write() = manifest;
        *self.activated_at.lock() = Instant::now();
        *self.last_error.lock() = None;
    }

    pub(crate) fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }

    pub async fn status(&self) -> PluginStatus {
        let manifest = self.manifest();
        let state = self.state();
        let runtime = self.runtime.read().await;
        let sandbox = match runtime.as_ref() {
            Some(PluginRuntime::Sandboxed(sandbox)) => Some(sandbox),
            _ => None,
        };

        let uptime_seconds = if state.accepts_calls() {
            self.activated_at.lock().elapsed().as_secs_f64()
        } else {
            0.0
        };
        let last_error = sandbox
            .and_then(SandboxSupervisor::last_error)
            .or_else(|| self.last_error.lock().clone());

        PluginStatus {
            name: manifest.name,
            version: manifest.version,
            mode: manifest.execution_mode,
            state,
            sandbox_state: sandbox.map(SandboxSupervisor::state),
            uptime_seconds,
            restarts: sandbox.map_or(0, SandboxSupervisor::restart_count),
            pid: sandbox.and_then(SandboxSupervisor::pid),
            memory_mb: sandbox.and_then(SandboxSupervisor::memory_mb),
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_cell_publishes_transitions() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cell = StateCell::new("core", events);

        cell.advance(PluginState::Loading).unwrap();
        assert!(cell.advance(PluginState::Running).is_err());
        cell.advance_lenient(PluginState::Unloaded);
        assert_eq!(cell.current(), PluginState::Loading);

        match rx.recv().await.unwrap() {
            PluginEvent::StateChanged { plugin, from, to } => {
                assert_eq!(plugin, "core");
                assert_eq!(from, PluginState::Unloaded);
                assert_eq!(to, PluginState::Loading);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(cell.history().len(), 1);
    }
}
