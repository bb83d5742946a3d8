//! Named hook points fired around plugin lifecycle events.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Fired after a plugin finished activating.
pub const PLUGIN_LOADED: &str = "plugin.loaded";
/// Fired after a plugin was unloaded.
pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
/// Fired after a plugin was reloaded.
pub const PLUGIN_RELOADED: &str = "plugin.reloaded";
/// Fired when a plugin failed to activate or was marked failed.
pub const PLUGIN_FAILED: &str = "plugin.failed";

/// Data handed to hook callbacks.
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub hook: String,
    pub plugin: String,
    pub data: Value,
}

pub type HookCallback = Arc<dyn Fn(&HookPayload) + Send + Sync>;

#[derive(Clone)]
struct RegisteredHook {
    owner: String,
    callback: HookCallback,
}

/// Registry of hook callbacks. Cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct HookManager {
    hooks: Arc<RwLock<HashMap<String, Vec<RegisteredHook>>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` on `hook`. `owner` is used for bulk removal on unload.
    pub fn register<F>(&self, hook: impl Into<String>, owner: impl Into<String>, callback: F)
    where
        F: Fn(&HookPayload) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry(hook.into())
            .or_default()
            .push(RegisteredHook {
                owner: owner.into(),
                callback: Arc::new(callback),
            });
    }

    /// Invokes every callback on `hook`, in registration order. Returns how many ran.
    pub fn fire(&self, hook: &str, plugin: &str, data: Value) -> usize {
        // Snapshot so callbacks may register hooks without deadlocking.
        let callbacks: Vec<HookCallback> = match self.hooks.read().get(hook) {
            Some(list) => list.iter().map(|h| Arc::clone(&h.callback)).collect(),
            None => return 0,
        };

        let payload = HookPayload {
            hook: hook.to_string(),
            plugin: plugin.to_string(),
            data,
        };
        for callback in &callbacks {
            callback(&payload);
        }
        callbacks.len()
    }

    /// Removes all callbacks registered by `owner`.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut hooks = self.hooks.write();
        let mut removed = 0;
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|h| h.owner != owner);
            removed += before - list.len();
        }
        hooks.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn count(&self, hook: &str) -> usize {
        self.hooks.read().get(hook).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        let mut names: Vec<&String> = hooks.keys().collect();
        names.sort();
        f.debug_struct("HookManager").field("hooks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_invokes_callbacks() {
        let hooks = HookManager::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        hooks.register(PLUGIN_LOADED, "audit", move |payload| {
            assert_eq!(payload.plugin, "auth");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hooks.fire(PLUGIN_LOADED, "auth", Value::Null), 1);
        assert_eq!(hooks.fire(PLUGIN_UNLOADED, "auth", Value::Null), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_owner() {
        let hooks = HookManager::new();
        hooks.register(PLUGIN_LOADED, "a", |_| {});
        hooks.register(PLUGIN_FAILED, "a", |_| {});
        hooks.register(PLUGIN_LOADED, "b", |_| {});

        assert_eq!(hooks.unregister_owner("a"), 2);
        assert_eq!(hooks.count(PLUGIN_LOADED), 1);
        assert_eq!(hooks.count(PLUGIN_FAILED), 0);
    }

    #[test]
    fn test_callback_can_register() {
        let hooks = HookManager::new();
        let inner = hooks.clone();
        hooks.register(PLUGIN_LOADED, "a", move |_| {
            inner.register(PLUGIN_RELOADED, "a", |_| {});
        });
        hooks.fire(PLUGIN_LOADED, "a", Value::Null);
        assert_eq!(hooks.count(PLUGIN_RELOADED), 1);
    }
}
