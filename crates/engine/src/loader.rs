//! Plugin discovery and dependency-ordered activation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use palisade_core::hook::{PLUGIN_FAILED, PLUGIN_LOADED, PLUGIN_RELOADED, PLUGIN_UNLOADED};
use palisade_core::{
    EventBus, HookManager, PalisadeError, PluginEvent, PluginManifest, PluginState, Result,
    SharedServiceMap,
};
use palisade_parser::load_manifest;
use palisade_plugin::{PluginContext, RouterHandle};
use palisade_security::{ScanReport, Scanner, verify_plugin};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::code_loader::{CodeLoader, LoadedCode};
use crate::config::RuntimeConfig;
use crate::dag::DependencyGraph;
use crate::handle::{PluginHandle, PluginRuntime, PluginStatus, StateCell};
use crate::lifecycle::TrustedPlugin;
use crate::sandbox::SandboxSupervisor;
use crate::scheduler::Scheduler;

/// Manifests found under a plugin root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub manifests: Vec<PluginManifest>,
    /// Directories that could not be used, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Validates every plugin directory directly under `root`.
///
/// Hidden (`.`) and private (`_`) directories are ignored. When two
/// directories declare the same name, the later one in sorted order is skipped.
pub fn discover(root: &Path) -> Result<Discovery> {
    let entries = std::fs::read_dir(root).map_err(|source| PalisadeError::FileRead {
        path: root.to_path_buf(),
        source,
    })?;

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut discovery = Discovery::default();
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();

    for dir in dirs {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if dir_name.starts_with('.') || dir_name.starts_with('_') {
            continue;
        }

        match load_manifest(&dir) {
            Ok(manifest) => {
                if let Some(first) = seen.get(&manifest.name) {
                    discovery.skipped.push((
                        dir_name,
                        format!(
                            "duplicate plugin name '{}' (already defined in {})",
                            manifest.name,
                            first.display()
                        ),
                    ));
                } else {
                    seen.insert(manifest.name.clone(), dir.clone());
                    discovery.manifests.push(manifest);
                }
            }
            Err(e) => discovery.skipped.push((dir_name, e.to_string())),
        }
    }

    Ok(discovery)
}

/// Outcome of a load operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Activated plugins, in activation order.
    pub loaded: Vec<String>,
    /// Plugins whose manifest was unusable.
    pub skipped: Vec<(String, String)>,
    /// Plugins that failed to activate or depended on one that did.
    pub failed: Vec<(String, String)>,
    /// Number of activation waves run.
    pub waves: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Owns every loaded plugin and the shared service map.
pub struct PluginLoader {
    config: Arc<RuntimeConfig>,
    services: SharedServiceMap,
    events: EventBus,
    hooks: HookManager,
    code_loaders: Vec<Arc<dyn CodeLoader>>,
    scanner: Scanner,
    handles: RwLock<BTreeMap<String, Arc<PluginHandle>>>,
    /// Every manifest seen, loaded or not.
    known: RwLock<BTreeMap<String, PluginManifest>>,
    failures: RwLock<BTreeMap<String, String>>,
    /// Activation order, for shutdown.
    order: Mutex<Vec<String>>,
    generation: AtomicU64,
    /// Serializes load, reload and unload operations.
    ops: tokio::sync::Mutex<()>,
}

impl PluginLoader {
    pub fn new(
        config: Arc<RuntimeConfig>,
        services: SharedServiceMap,
        events: EventBus,
        hooks: HookManager,
        code_loaders: Vec<Arc<dyn CodeLoader>>,
    ) -> Self {
        Self {
            config,
            services,
            events,
            hooks,
            code_loaders,
            scanner: Scanner::new(),
            handles: RwLock::new(BTreeMap::new()),
            known: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(BTreeMap::new()),
            order: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn services(&self) -> &SharedServiceMap {
        &self.services
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn handle(&self, name: &str) -> Option<Arc<PluginHandle>> {
        self.handles.read().get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.handles.read().contains_key(name)
    }

    /// Manifest of a loaded or known-but-failed plugin.
    pub fn manifest(&self, name: &str) -> Option<PluginManifest> {
        if let Some(handle) = self.handle(name) {
            return Some(handle.manifest());
        }
        self.known.read().get(name).cloned()
    }

    /// Why `name` is not running, if it failed.
    pub fn failure(&self, name: &str) -> Option<String> {
        self.failures.read().get(name).cloned()
    }

    /// Loaded plugins in activation order.
    pub fn loaded(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    /// Discovers the plugin root and activates everything, wave by wave.
    ///
    /// A dependency cycle fails before any plugin is activated. Other
    /// failures are confined to the plugin and its dependents.
    pub async fn load_all(self: &Arc<Self>) -> Result<LoadReport> {
        let _guard = self.ops.lock().await;

        let discovery = discover(&self.config.plugin_root)?;
        let mut report = LoadReport {
            skipped: discovery.skipped,
            ..LoadReport::default()
        };
        for (name, reason) in &report.skipped {
            warn!(plugin = %name, %reason, "skipping plugin");
        }

        let manifests: BTreeMap<String, PluginManifest> = discovery
            .manifests
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        let mut scheduler = Scheduler::new(DependencyGraph::from_manifests(manifests.values()))?
            .with_max_parallelism(self.config.max_parallelism)
            .with_active(self.loaded());

        self.known.write().extend(manifests.clone());

        for (name, reason) in scheduler.fail_missing() {
            warn!(plugin = %name, %reason, "plugin cannot be loaded");
            self.record_failure(&name, reason);
        }

        while let Some(wave) = scheduler.next_wave() {
            let pending: Vec<PluginManifest> = wave
                .plugins
                .iter()
                .filter_map(|name| manifests.get(name).cloned())
                .collect();

            report.waves = wave.number;
            debug!(wave = wave.number, plugins = ?wave.plugins, "activating wave");

            let outcomes = self
                .activate_wave(pending, scheduler.max_parallelism())
                .await;

            let mut activated = Vec::new();
            for (name, outcome) in outcomes {
                match outcome {
                    Ok(handle) => {
                        self.register(handle);
                        scheduler.mark_active(&name);
                        activated.push(name);
                    }
                    Err(e) => {
                        error!(plugin = %name, error = %e, "activation failed");
                        for (failed, reason) in scheduler.fail(&name, e.to_string()) {
                            if failed != name {
                                warn!(plugin = %failed, %reason, "cascading failure");
                            }
                            self.record_failure(&failed, reason);
                        }
                    }
                }
            }

            // Services become visible to the next wave only.
            for name in activated {
                self.flush_services(&name, false).await;
                self.fire_loaded(&name);
                report.loaded.push(name);
            }
        }

        report.failed = scheduler.into_failures().into_iter().collect();
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            waves = report.waves,
            "plugins loaded"
        );
        Ok(report)
    }

    /// Loads one plugin, loading its missing dependencies first.
    pub async fn load(self: &Arc<Self>, name: &str) -> Result<LoadReport> {
        let _guard = self.ops.lock().await;
        self.load_locked(name).await
    }

    async fn load_locked(self: &Arc<Self>, name: &str) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        if self.is_loaded(name) {
            return Ok(report);
        }

        let discovery = discover(&self.config.plugin_root)?;
        let graph = DependencyGraph::from_manifests(&discovery.manifests);
        let order = graph.load_order_for(name)?;
        let manifests: BTreeMap<String, PluginManifest> = discovery
            .manifests
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        for plugin in order {
            if self.is_loaded(&plugin) {
                continue;
            }
            let Some(manifest) = manifests.get(&plugin).cloned() else {
                return Err(PalisadeError::PluginNotFound(plugin));
            };
            self.known.write().insert(plugin.clone(), manifest.clone());

            report.waves += 1;
            match self.activate(manifest).await {
                Ok(handle) => {
                    self.register(handle);
                    self.flush_services(&plugin, false).await;
                    self.fire_loaded(&plugin);
                    report.loaded.push(plugin);
                }
                Err(e) => {
                    error!(plugin = %plugin, error = %e, "activation failed");
                    self.record_failure(&plugin, e.to_string());
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Re-reads the manifest and replaces the plugin's runtime.
    ///
    /// The plugin's own service keys are overwritten; nobody else's are touched.
    pub async fn reload(self: &Arc<Self>, name: &str) -> Result<()> {
        let _guard = self.ops.lock().await;

        let Some(handle) = self.handle(name) else {
            if self.known.read().contains_key(name) {
                return self.load_locked(name).await.map(|_| ());
            }
            return Err(PalisadeError::PluginNotFound(name.to_string()));
        };

        let manifest = load_manifest(&handle.manifest().directory)?;
        if manifest.name != name {
            return Err(PalisadeError::Load {
                plugin: name.to_string(),
                message: format!("manifest now declares the name '{}'", manifest.name),
            });
        }

        // Newly required plugins come up before the old runtime is torn down.
        let missing: Vec<String> = manifest
            .requires
            .iter()
            .filter(|dep| !self.is_loaded(dep))
            .cloned()
            .collect();
        for dependency in missing {
            debug!(plugin = %name, %dependency, "loading new dependency before reload");
            if let Err(e) = self.load_locked(&dependency).await {
                warn!(plugin = %name, %dependency, error = %e, "reload aborted");
                return Err(PalisadeError::Load {
                    plugin: name.to_string(),
                    message: format!("dependency '{dependency}' failed: {e}"),
                });
            }
        }

        self.known.write().insert(name.to_string(), manifest.clone());

        let state = handle.state_cell().clone();
        state.advance(PluginState::Reloading)?;
        info!(plugin = %name, version = %manifest.version, "reloading plugin");

        match handle.take_runtime().await {
            Some(PluginRuntime::Trusted(plugin)) => {
                plugin.notify_reload().await;
                if plugin.is_library_backed() {
                    self.services.remove_owned_by(name);
                }
                drop(plugin);
            }
            Some(PluginRuntime::Sandboxed(sandbox)) => sandbox.stop().await,
            None => {}
        }
        self.hooks.unregister_owner(name);

        match self.activate_runtime(&manifest, &state).await {
            Ok(runtime) => {
                handle.install(manifest, runtime).await;
                state.advance(PluginState::Running)?;
                self.failures.write().remove(name);

                self.flush_services(name, true).await;
                self.hooks.fire(PLUGIN_RELOADED, name, json!({}));
                info!(plugin = %name, "plugin reloaded");
                Ok(())
            }
            Err(e) => {
                error!(plugin = %name, error = %e, "reload failed");
                state.advance_lenient(PluginState::Failed);
                self.services.remove_owned_by(name);
                handle.record_error(e.to_string());
                self.record_failure(name, e.to_string());
                Err(e)
            }
        }
    }

    /// Unloads a plugin. Refuses while a loaded plugin requires it, unless forced.
    pub async fn unload(&self, name: &str, force: bool) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.unload_locked(name, force).await
    }

    async fn unload_locked(&self, name: &str, force: bool) -> Result<()> {
        let Some(handle) = self.handle(name) else {
            return Err(PalisadeError::PluginNotFound(name.to_string()));
        };

        if !force {
            let dependents: Vec<String> = self
                .handles
                .read()
                .values()
                .filter(|h| h.name() != name && h.manifest().requires.iter().any(|r| r == name))
                .map(|h| h.name().to_string())
                .collect();
            if !dependents.is_empty() {
                return Err(PalisadeError::Load {
                    plugin: name.to_string(),
                    message: format!("still required by {}", dependents.join(", ")),
                });
            }
        }

        let state = handle.state_cell();
        state.advance_lenient(PluginState::Unloading);
        match handle.take_runtime().await {
            Some(PluginRuntime::Trusted(plugin)) => {
                plugin.notify_unload().await;
                self.services.remove_owned_by(name);
                drop(plugin);
            }
            Some(PluginRuntime::Sandboxed(sandbox)) => {
                sandbox.stop().await;
                self.services.remove_owned_by(name);
            }
            None => {
                self.services.remove_owned_by(name);
            }
        }
        self.hooks.unregister_owner(name);
        state.advance_lenient(PluginState::Unloaded);

        self.handles.write().remove(name);
        self.order.lock().retain(|n| n != name);
        self.hooks.fire(PLUGIN_UNLOADED, name, json!({}));
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Unloads every plugin in reverse activation order.
    pub async fn shutdown(&self) {
        let _guard = self.ops.lock().await;
        let order: Vec<String> = self.order.lock().iter().rev().cloned().collect();
        for name in order {
            if let Err(e) = self.unload_locked(&name, true).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
    }

    /// Status rows for loaded plugins followed by failed ones.
    pub async fn statuses(&self) -> Vec<PluginStatus> {
        let handles: Vec<Arc<PluginHandle>> = {
            let order = self.order.lock().clone();
            let handles = self.handles.read();
            order.iter().filter_map(|n| handles.get(n).cloned()).collect()
        };

        let mut rows = Vec::with_capacity(handles.len());
        for handle in handles {
            rows.push(handle.status().await);
        }

        let failures = self.failures.read().clone();
        let known = self.known.read();
        for (name, reason) in failures {
            if self.is_loaded(&name) {
                continue;
            }
            if let Some(manifest) = known.get(&name) {
                rows.push(PluginStatus::failed(manifest, reason));
            }
        }
        rows
    }

    /// Router objects exposed by trusted plugins, in activation order.
    pub async fn routers(&self) -> Vec<(String, RouterHandle)> {
        let handles: Vec<Arc<PluginHandle>> = {
            let order = self.order.lock().clone();
            let handles = self.handles.read();
            order.iter().filter_map(|n| handles.get(n).cloned()).collect()
        };

        let mut routers = Vec::new();
        for handle in handles {
            if let Some(router) = handle.router().await {
                routers.push((handle.name().to_string(), router));
            }
        }
        routers
    }

    async fn activate_wave(
        self: &Arc<Self>,
        pending: Vec<PluginManifest>,
        max_parallelism: usize,
    ) -> Vec<(String, Result<Arc<PluginHandle>>)> {
        let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
        let mut expected: Vec<String> = pending.iter().map(|m| m.name.clone()).collect();
        let mut tasks = JoinSet::new();

        for manifest in pending {
            let loader = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let name = manifest.name.clone();
                let outcome = loader.activate(manifest).await;
                (name, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    expected.retain(|n| *n != name);
                    outcomes.push((name, outcome));
                }
                Err(e) => error!(error = %e, "activation task aborted"),
            }
        }
        for name in expected {
            let message = "activation task aborted".to_string();
            outcomes.push((
                name.clone(),
                Err(PalisadeError::Load {
                    plugin: name,
                    message,
                }),
            ));
        }

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Activates one plugin and walks it to `Running`.
    async fn activate(self: &Arc<Self>, manifest: PluginManifest) -> Result<Arc<PluginHandle>> {
        let state = StateCell::new(&manifest.name, self.events.clone());
        state.advance(PluginState::Loading)?;

        match self.activate_runtime(&manifest, &state).await {
            Ok(runtime) => {
                state.advance(PluginState::Ready)?;
                state.advance(PluginState::Running)?;
                Ok(Arc::new(PluginHandle::new(manifest, runtime, state)))
            }
            Err(e) => {
                state.advance_lenient(PluginState::Failed);
                Err(e)
            }
        }
    }

    async fn activate_runtime(
        &self,
        manifest: &PluginManifest,
        state: &StateCell,
    ) -> Result<PluginRuntime> {
        if manifest.execution_mode.is_in_process() {
            self.activate_trusted(manifest)
                .await
                .map(PluginRuntime::Trusted)
        } else {
            self.activate_sandboxed(manifest, state.clone())
                .await
                .map(PluginRuntime::Sandboxed)
        }
    }

    async fn activate_trusted(&self, manifest: &PluginManifest) -> Result<TrustedPlugin> {
        let report = self.scan(manifest).await?;
        for finding in &report.errors {
            warn!(plugin = %manifest.name, %finding, "scan finding");
        }
        for finding in &report.warnings {
            debug!(plugin = %manifest.name, %finding, "unrecognized import");
        }

        if manifest.needs_signature(self.config.strict_trust) {
            let key = self
                .config
                .signing_key
                .as_ref()
                .ok_or_else(|| PalisadeError::Signature {
                    plugin: manifest.name.clone(),
                    message: "a signature is required but no signing key is configured"
                        .to_string(),
                })?;
            verify_plugin(manifest, key)?;
            debug!(plugin = %manifest.name, "signature verified");
        }

        let code = self.load_code(manifest)?;
        TrustedPlugin::activate(manifest.clone(), code, self.context_for(manifest)).await
    }

    async fn activate_sandboxed(
        &self,
        manifest: &PluginManifest,
        state: StateCell,
    ) -> Result<SandboxSupervisor> {
        let report = self.scan(manifest).await?;
        for finding in &report.warnings {
            warn!(plugin = %manifest.name, %finding, "unrecognized import");
        }
        report.into_result()?;

        let sandbox = SandboxSupervisor::new(
            manifest.clone(),
            Arc::clone(&self.config),
            state,
            self.events.clone(),
        );
        sandbox.start().await?;
        Ok(sandbox)
    }

    async fn scan(&self, manifest: &PluginManifest) -> Result<ScanReport> {
        let scanner = self.scanner.clone();
        let target = manifest.clone();
        tokio::task::spawn_blocking(move || scanner.scan_plugin(&target))
            .await
            .map_err(|e| PalisadeError::Load {
                plugin: manifest.name.clone(),
                message: format!("scanner task failed: {e}"),
            })
    }

    fn load_code(&self, manifest: &PluginManifest) -> Result<LoadedCode> {
        let loader = self
            .code_loaders
            .iter()
            .find(|l| l.can_load(manifest))
            .ok_or_else(|| PalisadeError::Load {
                plugin: manifest.name.clone(),
                message: format!(
                    "no code loader accepts entry point '{}'",
                    manifest.entry_point
                ),
            })?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        loader.load(manifest, generation)
    }

    fn context_for(&self, manifest: &PluginManifest) -> PluginContext {
        PluginContext::new(&manifest.name, &manifest.directory, self.services.clone())
            .with_events(self.events.clone())
            .with_hooks(self.hooks.clone())
            .with_env(manifest.env.clone())
            .with_extra(manifest.extra.clone())
            .with_filesystem(manifest.filesystem.clone())
    }

    fn register(&self, handle: Arc<PluginHandle>) {
        let name = handle.name().to_string();
        self.failures.write().remove(&name);
        self.order.lock().push(name.clone());
        self.handles.write().insert(name, handle);
    }

    async fn flush_services(&self, name: &str, reload: bool) {
        let Some(handle) = self.handle(name) else {
            return;
        };
        let services = handle.services().await;
        if services.is_empty() && !reload {
            return;
        }
        let outcome = if reload {
            self.services.flush_reload(name, services)
        } else {
            self.services.flush_additive(name, services)
        };
        self.publish_flush(name, outcome.written);
    }

    fn publish_flush(&self, name: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        debug!(plugin = %name, ?keys, "services flushed");
        self.events.publish(PluginEvent::ServicesFlushed {
            plugin: name.to_string(),
            keys,
        });
    }

    fn fire_loaded(&self, name: &str) {
        if let Some(manifest) = self.manifest(name) {
            self.hooks.fire(
                PLUGIN_LOADED,
                name,
                json!({"version": manifest.version, "mode": manifest.execution_mode}),
            );
        }
    }

    fn record_failure(&self, name: &str, reason: String) {
        self.failures.write().insert(name.to_string(), reason.clone());
        self.hooks.fire(PLUGIN_FAILED, name, json!({"reason": reason}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_loader::StaticRegistry;
    use async_trait::async_trait;
    use palisade_core::Services;
    use palisade_plugin::{Plugin, PluginFactory, PluginFault};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    /// Trusted plugin publishing fixed services.
    struct Provider {
        services: Vec<(&'static str, String)>,
        fail_load: bool,
    }

    #[async_trait]
    impl Plugin for Provider {
        async fn handle(&self, _action: &str, _payload: Value) -> std::result::Result<Value, PluginFault> {
            Ok(json!({"ok": true}))
        }

        async fn on_load(&self) -> std::result::Result<(), PluginFault> {
            if self.fail_load {
                return Err(PluginFault::new("refusing to start"));
            }
            Ok(())
        }

        fn services(&self) -> Services {
            self.services
                .iter()
                .map(|(k, v)| (k.to_string(), Arc::new(v.clone()) as palisade_core::Service))
                .collect()
        }
    }

    fn provider(services: &[(&'static str, &str)]) -> PluginFactory {
        let services: Vec<(&'static str, String)> =
            services.iter().map(|(k, v)| (*k, v.to_string())).collect();
        PluginFactory::plain(move || {
            Box::new(Provider {
                services: services.clone(),
                fail_load: false,
            })
        })
    }

    fn write_plugin(root: &Path, dir: &str, yaml: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("plugin.yaml"), yaml).unwrap();
    }

    fn trusted(name: &str, requires: &[&str]) -> String {
        format!(
            "name: {name}\nversion: '1.0'\nexecution_mode: trusted\nentry_point: builtin:{name}\nrequires: [{}]\n",
            requires.join(", ")
        )
    }

    fn loader(root: &Path, registry: StaticRegistry) -> Arc<PluginLoader> {
        loader_with(RuntimeConfig::new(root), registry)
    }

    fn loader_with(config: RuntimeConfig, registry: StaticRegistry) -> Arc<PluginLoader> {
        Arc::new(PluginLoader::new(
            Arc::new(config),
            SharedServiceMap::new(),
            EventBus::default(),
            HookManager::new(),
            vec![Arc::new(registry)],
        ))
    }

    #[test]
    fn test_discover_skips_bad_and_duplicate() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "a_core", &trusted("core", &[]));
        write_plugin(root.path(), "b_core_again", &trusted("core", &[]));
        write_plugin(root.path(), "broken", "version: '1'\n");
        write_plugin(root.path(), ".hidden", &trusted("hidden", &[]));
        write_plugin(root.path(), "_private", &trusted("private", &[]));

        let discovery = discover(root.path()).unwrap();
        let names: Vec<&str> = discovery.manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["core"]);

        let skipped: Vec<&str> = discovery.skipped.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(skipped, vec!["b_core_again", "broken"]);
        assert!(discovery.skipped[0].1.contains("duplicate"));
    }

    #[tokio::test]
    async fn test_dependency_sees_services_of_earlier_wave() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(root.path(), "auth", &trusted("auth", &["core"]));

        let saw_db = Arc::new(AtomicBool::new(false));
        let registry = StaticRegistry::new();
        registry.register("builtin:core", provider(&[("db", "postgres")]));
        let flag = Arc::clone(&saw_db);
        registry.register(
            "builtin:auth",
            PluginFactory::with_context(move |ctx| {
                let db = ctx.service::<String>("db");
                flag.store(db.as_deref().map(String::as_str) == Some("postgres"), Ordering::SeqCst);
                Box::new(Provider {
                    services: vec![("sessions", "memory".to_string())],
                    fail_load: false,
                })
            }),
        );

        let loader = loader(root.path(), registry);
        let report = loader.load_all().await.unwrap();

        assert_eq!(report.loaded, vec!["core", "auth"]);
        assert_eq!(report.waves, 2);
        assert!(report.is_clean());
        assert!(saw_db.load(Ordering::SeqCst));
        assert_eq!(loader.services().owner("sessions").as_deref(), Some("auth"));
        assert_eq!(loader.handle("auth").unwrap().state(), PluginState::Running);
    }

    #[tokio::test]
    async fn test_failures_cascade_without_aborting_boot() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "base", &trusted("base", &[]));
        write_plugin(root.path(), "child", &trusted("child", &["base"]));
        write_plugin(root.path(), "grandchild", &trusted("grandchild", &["child"]));
        write_plugin(root.path(), "orphan", &trusted("orphan", &["ghost"]));
        write_plugin(root.path(), "solo", &trusted("solo", &[]));

        let registry = StaticRegistry::new();
        registry.register(
            "builtin:base",
            PluginFactory::plain(|| {
                Box::new(Provider {
                    services: Vec::new(),
                    fail_load: true,
                })
            }),
        );
        for name in ["child", "grandchild", "orphan", "solo"] {
            registry.register(format!("builtin:{name}"), provider(&[]));
        }

        let loader = loader(root.path(), registry);
        let report = loader.load_all().await.unwrap();

        assert_eq!(report.loaded, vec!["solo"]);
        let failed: BTreeMap<String, String> = report.failed.into_iter().collect();
        assert_eq!(failed.len(), 4);
        assert!(failed["base"].contains("refusing to start"));
        assert_eq!(failed["child"], "dependency 'base' failed");
        assert_eq!(failed["grandchild"], "dependency 'base' failed");
        assert!(failed["orphan"].contains("ghost"));
        assert!(loader.failure("child").is_some());
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_activation() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "a", &trusted("a", &["b"]));
        write_plugin(root.path(), "b", &trusted("b", &["a"]));
        write_plugin(root.path(), "c", &trusted("c", &[]));

        let registry = StaticRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(format!("builtin:{name}"), provider(&[]));
        }

        let loader = loader(root.path(), registry);
        let err = loader.load_all().await.unwrap_err();
        assert!(matches!(err, PalisadeError::CycleDetected { .. }));
        assert!(loader.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_reload_overwrites_only_own_keys() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(root.path(), "metrics", &trusted("metrics", &[]));

        let generation = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&generation);
        let registry = StaticRegistry::new();
        registry.register(
            "builtin:core",
            PluginFactory::plain(move || {
                let services = match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => vec![("db", "v1".to_string()), ("cache", "v1".to_string())],
                    _ => vec![("db", "v2".to_string()), ("stats", "hijacked".to_string())],
                };
                Box::new(Provider {
                    services,
                    fail_load: false,
                })
            }),
        );
        registry.register("builtin:metrics", provider(&[("stats", "prometheus")]));

        let loader = loader(root.path(), registry);
        loader.services().insert_host("config", Arc::new("host".to_string()));
        loader.load_all().await.unwrap();

        loader.reload("core").await.unwrap();

        let services = loader.services();
        assert_eq!(services.get_as::<String>("db").unwrap().as_str(), "v2");
        assert!(!services.contains("cache"));
        assert_eq!(services.get_as::<String>("stats").unwrap().as_str(), "prometheus");
        assert_eq!(services.owner("stats").as_deref(), Some("metrics"));
        assert_eq!(services.get_as::<String>("config").unwrap().as_str(), "host");
        assert_eq!(loader.handle("core").unwrap().state(), PluginState::Running);
    }

    #[tokio::test]
    async fn test_reload_loads_newly_required_dependency() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "auth", &trusted("auth", &[]));

        let registry = StaticRegistry::new();
        registry.register("builtin:core", provider(&[("db", "pg")]));
        registry.register("builtin:auth", provider(&[]));

        let loader = loader(root.path(), registry);
        loader.load_all().await.unwrap();
        assert_eq!(loader.loaded(), vec!["auth"]);

        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(root.path(), "auth", &trusted("auth", &["core"]));
        loader.reload("auth").await.unwrap();

        assert_eq!(loader.loaded(), vec!["auth", "core"]);
        assert_eq!(loader.handle("core").unwrap().state(), PluginState::Running);
        assert_eq!(loader.manifest("auth").unwrap().requires, vec!["core"]);
        assert_eq!(loader.services().get_as::<String>("db").unwrap().as_str(), "pg");

        write_plugin(root.path(), "auth", &trusted("auth", &["core", "ghost"]));
        let err = loader.reload("auth").await.unwrap_err();
        assert!(err.to_string().contains("dependency 'ghost' failed"));
        assert_eq!(loader.handle("auth").unwrap().state(), PluginState::Running);
        assert_eq!(loader.manifest("auth").unwrap().requires, vec!["core"]);
    }

    #[tokio::test]
    async fn test_unload_respects_dependents_and_shutdown_order() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(root.path(), "auth", &trusted("auth", &["core"]));

        let registry = StaticRegistry::new();
        registry.register("builtin:core", provider(&[("db", "pg")]));
        registry.register("builtin:auth", provider(&[]));

        let loader = loader(root.path(), registry);
        let unloaded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&unloaded);
        loader.hooks().register(PLUGIN_UNLOADED, "test", move |payload| {
            sink.lock().push(payload.plugin.clone());
        });
        loader.load_all().await.unwrap();

        let err = loader.unload("core", false).await.unwrap_err();
        assert!(err.to_string().contains("auth"));

        loader.shutdown().await;
        assert_eq!(*unloaded.lock(), vec!["auth".to_string(), "core".to_string()]);
        assert!(loader.loaded().is_empty());
        assert!(!loader.services().contains("db"));
    }

    #[tokio::test]
    async fn test_load_single_pulls_dependencies() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(root.path(), "auth", &trusted("auth", &["core"]));
        write_plugin(root.path(), "unrelated", &trusted("unrelated", &[]));

        let registry = StaticRegistry::new();
        for name in ["core", "auth", "unrelated"] {
            registry.register(format!("builtin:{name}"), provider(&[]));
        }

        let loader = loader(root.path(), registry);
        let report = loader.load("auth").await.unwrap();
        assert_eq!(report.loaded, vec!["core", "auth"]);
        assert!(!loader.is_loaded("unrelated"));
        assert!(matches!(
            loader.load("ghost").await,
            Err(PalisadeError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_trust_fails_closed_without_key() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "core", &trusted("core", &[]));
        write_plugin(
            root.path(),
            "old",
            "name: old\nversion: '1'\nexecution_mode: legacy\nentry_point: builtin:old\n",
        );

        let registry = StaticRegistry::new();
        registry.register("builtin:core", provider(&[]));
        registry.register("builtin:old", provider(&[]));

        let loader = loader_with(
            RuntimeConfig::new(root.path()).with_strict_trust(true),
            registry,
        );
        let report = loader.load_all().await.unwrap();

        assert_eq!(report.loaded, vec!["old"]);
        assert!(report.failed[0].1.contains("signing key"));
    }

    #[tokio::test]
    async fn test_sandboxed_scan_failure_blocks_activation() {
        let root = TempDir::new().unwrap();
        write_plugin(
            root.path(),
            "shell",
            "name: shell\nversion: '1'\nexecution_mode: sandboxed\nentry_point: src/main.py\n",
        );
        std::fs::create_dir_all(root.path().join("shell/src")).unwrap();
        std::fs::write(root.path().join("shell/src/main.py"), "import os\n").unwrap();

        let loader = loader(root.path(), StaticRegistry::new());
        let report = loader.load_all().await.unwrap();

        assert!(report.loaded.is_empty());
        assert_eq!(report.failed[0].0, "shell");
        assert!(report.failed[0].1.contains("os"));

        let statuses = loader.statuses().await;
        assert_eq!(statuses[0].state, PluginState::Failed);
    }
}
