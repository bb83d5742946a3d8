//! The plugin author contract.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use palisade_core::Services;

use crate::context::PluginContext;
use crate::fault::PluginFault;

/// Opaque HTTP route object a plugin hands to the web layer.
pub type RouterHandle = Arc<dyn Any + Send + Sync>;

/// An extension module driven by the runtime.
///
/// Only [`Plugin::handle`] is required. Plugins built by a plain factory get
/// their context through [`Plugin::attach`] right after construction.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Handles one action. Non-object return values are wrapped as
    /// `{"status": "ok", "result": value}`.
    async fn handle(&self, action: &str, payload: Value) -> Result<Value, PluginFault>;

    /// Receives the runtime context.
    fn attach(&mut self, _ctx: PluginContext) {}

    async fn on_load(&self) -> Result<(), PluginFault> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<(), PluginFault> {
        Ok(())
    }

    /// Called on the old instance before it is replaced.
    async fn on_reload(&self) -> Result<(), PluginFault> {
        Ok(())
    }

    /// Services to publish into the shared map once the load wave finishes.
    fn services(&self) -> Services {
        Services::new()
    }

    fn router(&self) -> Option<RouterHandle> {
        None
    }
}
