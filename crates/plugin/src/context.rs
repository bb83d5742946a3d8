//! Runtime context handed to in-process plugins.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use palisade_core::{
    EventBus, FilesystemPolicy, HookManager, HookPayload, PluginEvent, SharedServiceMap,
};

/// Everything a plugin instance may use from its host.
#[derive(Debug, Clone)]
pub struct PluginContext {
    name: String,
    directory: PathBuf,
    services: SharedServiceMap,
    events: EventBus,
    hooks: HookManager,
    env: BTreeMap<String, String>,
    extra: Map<String, Value>,
    filesystem: FilesystemPolicy,
}

impl PluginContext {
    /// Creates a context with fresh event bus and hook manager.
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        services: SharedServiceMap,
    ) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            services,
            events: EventBus::default(),
            hooks: HookManager::new(),
            env: BTreeMap::new(),
            extra: Map::new(),
            filesystem: FilesystemPolicy::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_filesystem(mut self, filesystem: FilesystemPolicy) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The shared service map.
    pub fn services(&self) -> &SharedServiceMap {
        &self.services
    }

    /// Looks up a service and downcasts it to `T`.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get_as::<T>(name)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    /// Resolved environment variables from the manifest.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Free-form configuration from the manifest.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn filesystem(&self) -> &FilesystemPolicy {
        &self.filesystem
    }

    /// Whether the plugin's filesystem policy allows `path`.
    pub fn may_access(&self, path: &Path) -> bool {
        self.filesystem.permits(&self.directory, path)
    }

    /// Publishes a custom event under this plugin's name.
    pub fn publish(&self, topic: impl Into<String>, data: Value) -> usize {
        self.events.publish(PluginEvent::Custom {
            plugin: self.name.clone(),
            topic: topic.into(),
            data,
        })
    }

    /// Registers a hook callback owned by this plugin. It is removed on unload.
    pub fn register_hook<F>(&self, hook: impl Into<String>, callback: F)
    where
        F: Fn(&HookPayload) + Send + Sync + 'static,
    {
        self.hooks.register(hook, self.name.clone(), callback);
    }
}
