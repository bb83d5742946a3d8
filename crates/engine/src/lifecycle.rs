//! In-process (trusted and legacy) plugin instances.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use palisade_core::{PalisadeError, PluginManifest, Result, Services};
use palisade_plugin::{Plugin, PluginContext, PluginFault, RouterHandle, normalize_response};
use serde_json::Value;
use tokio::task::JoinError;
use tracing::{info, warn};

use crate::code_loader::{LoadedCode, LoadedLibrary};

/// A live in-process plugin.
pub struct TrustedPlugin {
    // Declaration order is drop order: instance and factory go before the
    // library that holds their code.
    instance: Arc<dyn Plugin>,
    router: Option<RouterHandle>,
    code: LoadedCode,
    manifest: PluginManifest,
}

impl TrustedPlugin {
    /// Instantiates the plugin and runs its `on_load` hook.
    pub async fn activate(
        manifest: PluginManifest,
        code: LoadedCode,
        ctx: PluginContext,
    ) -> Result<Self> {
        let instance: Arc<dyn Plugin> = Arc::from(code.factory.instantiate(ctx));

        let hook = Arc::clone(&instance);
        guarded(&manifest, async move { hook.on_load().await }).await?;

        let router = instance.router();
        info!(plugin = %manifest.name, version = %manifest.version, "trusted plugin loaded");

        Ok(Self {
            instance,
            router,
            code,
            manifest,
        })
    }

    /// Runs `handle` under the plugin timeout, catching panics.
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        let instance = Arc::clone(&self.instance);
        let action = action.to_string();
        let value = guarded(&self.manifest, async move {
            instance.handle(&action, payload).await
        })
        .await?;
        Ok(normalize_response(value))
    }

    /// Services the instance wants published.
    pub fn services(&self) -> Services {
        self.instance.services()
    }

    pub fn router(&self) -> Option<RouterHandle> {
        self.router.clone()
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn library(&self) -> Option<&LoadedLibrary> {
        self.code.library.as_ref()
    }

    /// Runs `on_reload` ahead of replacement. Failures are logged only.
    pub async fn notify_reload(&self) {
        let hook = Arc::clone(&self.instance);
        if let Err(e) = guarded(&self.manifest, async move { hook.on_reload().await }).await {
            warn!(plugin = %self.manifest.name, error = %e, "on_reload failed");
        }
    }

    /// Runs `on_unload`. Dropping the plugin afterwards releases its library.
    pub async fn notify_unload(&self) {
        let hook = Arc::clone(&self.instance);
        if let Err(e) = guarded(&self.manifest, async move { hook.on_unload().await }).await {
            warn!(plugin = %self.manifest.name, error = %e, "on_unload failed");
        }
    }

    /// Whether the plugin's code comes from a mapped library.
    pub fn is_library_backed(&self) -> bool {
        self.code.library.is_some()
    }
}

/// Runs plugin code on its own task, bounded by the manifest timeout.
///
/// Faults become `Plugin` errors, panics become `plugin_error`, and an
/// expired timeout aborts the task, waits for it to unwind and yields `Timeout`.
async fn guarded<F, T>(manifest: &PluginManifest, work: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, PluginFault>> + Send + 'static,
    T: Send + 'static,
{
    let timeout = manifest.resources.timeout();
    let mut task = tokio::spawn(work);

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(fault))) => Err(PalisadeError::Plugin {
            plugin: manifest.name.clone(),
            message: fault.to_string(),
            code: Some(fault.code().to_string()),
        }),
        Ok(Err(join)) => Err(PalisadeError::Plugin {
            plugin: manifest.name.clone(),
            message: join_failure(join),
            code: None,
        }),
        Err(_) => {
            // The plugin instance must be released before its library can close.
            task.abort();
            let _ = task.await;
            Err(timed_out(&manifest.name, timeout))
        }
    }
}

fn timed_out(plugin: &str, timeout: Duration) -> PalisadeError {
    PalisadeError::Timeout {
        plugin: plugin.to_string(),
        timeout,
    }
}

fn join_failure(join: JoinError) -> String {
    if !join.is_panic() {
        return "plugin task was cancelled".to_string();
    }
    let panic = join.into_panic();
    let detail = panic_message(panic.as_ref());
    format!("plugin panicked: {detail}")
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
