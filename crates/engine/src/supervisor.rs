//! The runtime's public entry point.

use std::sync::Arc;

use palisade_core::{
    EventBus, HookManager, PalisadeError, PluginEvent, Result, Service, SharedServiceMap,
};
use palisade_plugin::{PluginFactory, RouterHandle};
use palisade_security::Scanner;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::code_loader::{CodeLoader, DylibLoader, StaticRegistry};
use crate::config::RuntimeConfig;
use crate::handle::PluginStatus;
use crate::limits::RateLimiter;
use crate::loader::{LoadReport, PluginLoader};

/// Assembles a [`Supervisor`].
pub struct SupervisorBuilder {
    /// Runtime configuration.
    config: RuntimeConfig,

    /// Services seeded by the host before any plugin loads.
    host_services: Vec<(String, Service)>,

    /// Factories compiled into the host.
    registry: StaticRegistry,

    /// Extra code loaders, consulted before the dynamic library loader.
    code_loaders: Vec<Arc<dyn CodeLoader>>,

    /// Scanner override.
    scanner: Option<Scanner>,

    /// Event bus capacity.
    event_capacity: Option<usize>,
}

impl SupervisorBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            host_services: Vec::new(),
            registry: StaticRegistry::new(),
            code_loaders: Vec::new(),
            scanner: None,
            event_capacity: None,
        }
    }

    /// Seeds a host-owned service that plugins can read but never replace.
    pub fn with_service(mut self, name: impl Into<String>, service: Service) -> Self {
        self.host_services.push((name.into(), service));
        self
    }

    /// Registers a trusted plugin built into the host under `entry_point`.
    pub fn register_static(self, entry_point: impl Into<String>, factory: PluginFactory) -> Self {
        self.registry.register(entry_point, factory);
        self
    }

    pub fn with_code_loader(mut self, loader: Arc<dyn CodeLoader>) -> Self {
        self.code_loaders.push(loader);
        self
    }

    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Supervisor {
        let services = SharedServiceMap::new();
        for (name, service) in self.host_services {
            services.insert_host(name, service);
        }
        let events = self
            .event_capacity
            .map(EventBus::new)
            .unwrap_or_default();

        // Static entries win over files, then custom loaders, then libraries.
        let mut code_loaders: Vec<Arc<dyn CodeLoader>> = vec![Arc::new(self.registry)];
        code_loaders.extend(self.code_loaders);
        code_loaders.push(Arc::new(DylibLoader::new(self.config.scratch_dir.clone())));

        let mut loader = PluginLoader::new(
            Arc::new(self.config),
            services,
            events,
            HookManager::new(),
            code_loaders,
        );
        if let Some(scanner) = self.scanner {
            loader = loader.with_scanner(scanner);
        }

        Supervisor {
            loader: Arc::new(loader),
            limiter: RateLimiter::new(),
        }
    }
}

/// Loads plugins and routes calls to them.
///
/// Every call passes the rate limiter, then the plugin's retry policy.
/// [`Supervisor::call`] never fails: errors come back as structured JSON.
pub struct Supervisor {
    loader: Arc<PluginLoader>,
    limiter: RateLimiter,
}

impl Supervisor {
    pub fn builder(config: RuntimeConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// Discovers and activates every plugin under the plugin root.
    pub async fn boot(&self) -> Result<LoadReport> {
        self.loader.load_all().await
    }

    /// Calls `action` on `plugin`, rendering any failure as an error response.
    pub async fn call(&self, plugin: &str, action: &str, payload: Value) -> Value {
        match self.try_call(plugin, action, payload).await {
            Ok(response) => response,
            Err(e) => {
                debug!(plugin = %plugin, action = %action, code = e.code(), "call failed");
                e.to_response()
            }
        }
    }

    /// Typed variant of [`Supervisor::call`].
    pub async fn try_call(&self, plugin: &str, action: &str, payload: Value) -> Result<Value> {
        let manifest = self
            .loader
            .manifest(plugin)
            .ok_or_else(|| PalisadeError::PluginNotFound(plugin.to_string()))?;

        self.limiter.check(plugin, &manifest.resources.rate_limit)?;

        let handle = self.loader.handle(plugin).ok_or_else(|| {
            let reason = self
                .loader
                .failure(plugin)
                .unwrap_or_else(|| "plugin is not loaded".to_string());
            PalisadeError::Unavailable {
                plugin: plugin.to_string(),
                reason,
            }
        })?;

        let max_attempts = manifest.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match handle.call(action, payload.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !err.is_retriable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                if attempt == 1 {
                    return Err(err);
                }
                return Err(PalisadeError::RetriesExhausted {
                    plugin: plugin.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = manifest.retry.backoff_for(attempt - 1);
            warn!(
                plugin = %plugin,
                action = %action,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn status(&self) -> Vec<PluginStatus> {
        self.loader.statuses().await
    }

    /// Loads one plugin and whatever it requires.
    pub async fn load(&self, plugin: &str) -> Result<LoadReport> {
        self.loader.load(plugin).await
    }

    pub async fn reload(&self, plugin: &str) -> Result<()> {
        self.loader.reload(plugin).await
    }

    pub async fn unload(&self, plugin: &str, force: bool) -> Result<()> {
        self.loader.unload(plugin, force).await?;
        self.limiter.reset(plugin);
        Ok(())
    }

    /// Unloads everything in reverse activation order.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }

    pub async fn routers(&self) -> Vec<(String, RouterHandle)> {
        self.loader.routers().await
    }

    pub fn services(&self) -> &SharedServiceMap {
        self.loader.services()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.loader.events().subscribe()
    }

    pub fn hooks(&self) -> &HookManager {
        self.loader.hooks()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.loader.config()
    }

    /// Loaded plugins in activation order.
    pub fn loaded(&self) -> Vec<String> {
        self.loader.loaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use palisade_plugin::{Plugin, PluginFault};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails the first `failures` calls, then answers.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Plugin for Flaky {
        async fn handle(&self, action: &str, _payload: Value) -> std::result::Result<Value, PluginFault> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match action {
                "flaky" if n < self.failures => Err(PluginFault::new(format!("attempt {n} broke"))),
                "flaky" => Ok(json!({"attempt": n})),
                other => Err(PluginFault::UnknownAction(other.to_string())),
            }
        }
    }

    fn write_manifest(root: &Path, yaml: &str) {
        let dir = root.join("flaky");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.yaml"), yaml).unwrap();
    }

    async fn boot(root: &Path, failures: u32, extra: &str) -> (Supervisor, Arc<AtomicU32>) {
        write_manifest(
            root,
            &format!(
                "name: flaky\nversion: '1'\nexecution_mode: trusted\nentry_point: builtin:flaky\n{extra}"
            ),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let supervisor = Supervisor::builder(RuntimeConfig::new(root))
            .register_static(
                "builtin:flaky",
                PluginFactory::plain(move || {
                    Box::new(Flaky {
                        failures,
                        calls: Arc::clone(&counter),
                    })
                }),
            )
            .build();
        supervisor.boot().await.unwrap();
        (supervisor, calls)
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let root = TempDir::new().unwrap();
        let (supervisor, calls) = boot(
            root.path(),
            2,
            "retry: {max_attempts: 3, backoff_seconds: 0.01, max_backoff_seconds: 0.02}\n",
        )
        .await;

        let response = supervisor.call("flaky", "flaky", json!({})).await;
        assert_eq!(response, json!({"status": "ok", "attempt": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_reported() {
        let root = TempDir::new().unwrap();
        let (supervisor, calls) = boot(
            root.path(),
            10,
            "retry: {max_attempts: 2, backoff_seconds: 0.01, max_backoff_seconds: 0.01}\n",
        )
        .await;

        let err = supervisor
            .try_call("flaky", "flaky", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PalisadeError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_before_dispatch() {
        let root = TempDir::new().unwrap();
        let (supervisor, calls) = boot(
            root.path(),
            0,
            "resources: {rate_limit: {calls: 2, period_seconds: 60}}\n",
        )
        .await;

        assert_eq!(supervisor.call("flaky", "flaky", json!({}))
            .await["status"], "ok");
        assert_eq!(supervisor.call("flaky", "flaky", json!({}))
            .await["status"], "ok");

        let response = supervisor.call("flaky", "flaky", json!({})).await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["code"], "rate_limited");
        assert!(response["retry_after_seconds"].as_f64().unwrap() > 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_unloaded_plugins() {
        let root = TempDir::new().unwrap();
        let (supervisor, _) = boot(root.path(), 0, "").await;

        let response = supervisor.call("ghost", "anything", json!({})).await;
        assert_eq!(response["code"], "not_found");

        supervisor.unload("flaky", false).await.unwrap();
        let response = supervisor.call("flaky", "flaky", json!({})).await;
        assert_eq!(response["code"], "unavailable");
    }

    #[tokio::test]
    async fn test_host_services_survive_plugins() {
        let root = TempDir::new().unwrap();
        write_manifest(
            root.path(),
            "name: flaky\nversion: '1'\nexecution_mode: trusted\nentry_point: builtin:flaky\n",
        );
        let supervisor = Supervisor::builder(RuntimeConfig::new(root.path()))
            .with_service("config", Arc::new("host".to_string()))
            .build();

        let report = supervisor.boot().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            supervisor.services().get_as::<String>("config").unwrap().as_str(),
            "host"
        );
    }
}
