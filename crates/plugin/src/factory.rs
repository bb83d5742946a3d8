//! Plugin constructors and the dynamic library export ABI.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::context::PluginContext;
use crate::contract::Plugin;

/// ABI revision checked when loading a dynamic library.
pub const ABI_VERSION: u32 = 1;

/// Symbol returning [`ABI_VERSION`] from a plugin library.
pub const ABI_VERSION_SYMBOL: &[u8] = b"_palisade_abi_version";

/// Symbol returning a boxed [`PluginFactory`] from a plugin library.
pub const CREATE_SYMBOL: &[u8] = b"_palisade_plugin_create";

/// Signature of [`ABI_VERSION_SYMBOL`].
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Signature of [`CREATE_SYMBOL`]. Returns `Box<PluginFactory>` as a raw pointer.
pub type CreateFn = unsafe extern "C" fn() -> *mut c_void;

type ContextConstructor = dyn Fn(PluginContext) -> Box<dyn Plugin> + Send + Sync;
type PlainConstructor = dyn Fn() -> Box<dyn Plugin> + Send + Sync;

/// Builds plugin instances.
#[derive(Clone)]
pub enum PluginFactory {
    /// Receives the context as a constructor argument.
    WithContext(Arc<ContextConstructor>),
    /// Builds a bare instance; the context is delivered through `attach`.
    Plain(Arc<PlainConstructor>),
}

impl PluginFactory {
    pub fn with_context<F>(constructor: F) -> Self
    where
        F: Fn(PluginContext) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self::WithContext(Arc::new(constructor))
    }

    pub fn plain<F>(constructor: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self::Plain(Arc::new(constructor))
    }

    /// Creates an instance bound to `ctx`.
    pub fn instantiate(&self, ctx: PluginContext) -> Box<dyn Plugin> {
        match self {
            Self::WithContext(constructor) => constructor(ctx),
            Self::Plain(constructor) => {
                let mut plugin = constructor();
                plugin.attach(ctx);
                plugin
            }
        }
    }

    /// Moves the factory to the heap for [`CREATE_SYMBOL`].
    pub fn into_raw(self) -> *mut c_void {
        Box::into_raw(Box::new(self)).cast()
    }

    /// Takes back a factory produced by [`PluginFactory::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw`, built by the same compiler and
    /// `palisade-plugin` version, and must not be used afterwards.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        // SAFETY: guaranteed by the caller.
        unsafe { *Box::from_raw(ptr.cast::<PluginFactory>()) }
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WithContext(_) => f.write_str("PluginFactory::WithContext"),
            Self::Plain(_) => f.write_str("PluginFactory::Plain"),
        }
    }
}

/// Exports a plugin from a `cdylib` crate.
///
/// ```ignore
/// palisade_plugin::export_plugin!(PluginFactory::plain(|| Box::new(MyPlugin::default())));
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($factory:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _palisade_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _palisade_plugin_create() -> *mut ::std::ffi::c_void {
            let factory: $crate::PluginFactory = $factory;
            factory.into_raw()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::PluginFault;
    use async_trait::async_trait;
    use palisade_core::SharedServiceMap;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Named {
        name: Option<String>,
    }

    #[async_trait]
    impl Plugin for Named {
        async fn handle(&self, _action: &str, _payload: Value) -> Result<Value, PluginFault> {
            Ok(json!({ "name": self.name }))
        }

        fn attach(&mut self, ctx: PluginContext) {
            self.name = Some(ctx.name().to_string());
        }
    }

    fn ctx() -> PluginContext {
        PluginContext::new("named", "/plugins/named", SharedServiceMap::new())
    }

    #[tokio::test]
    async fn test_plain_factory_attaches_context() {
        let factory = PluginFactory::plain(|| Box::new(Named::default()));
        let plugin = factory.instantiate(ctx());
        let out = plugin.handle("who", Value::Null).await.unwrap();
        assert_eq!(out["name"], "named");
    }

    #[tokio::test]
    async fn test_context_factory() {
        let factory = PluginFactory::with_context(|ctx| {
            Box::new(Named {
                name: Some(format!("{}!", ctx.name())),
            })
        });
        let plugin = factory.instantiate(ctx());
        let out = plugin.handle("who", Value::Null).await.unwrap();
        assert_eq!(out["name"], "named!");
    }

    #[tokio::test]
    async fn test_raw_round_trip() {
        let raw = PluginFactory::plain(|| Box::new(Named::default())).into_raw();
        // SAFETY: produced by into_raw just above.
        let factory = unsafe { PluginFactory::from_raw(raw) };
        assert!(matches!(factory, PluginFactory::Plain(_)));
    }
}
