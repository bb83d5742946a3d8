//! Palisade Plugin - The contract between plugins and the Palisade runtime.
//!
//! In-process plugins implement [`Plugin`] and are built by a
//! [`PluginFactory`], either registered by the host binary or exported from a
//! dynamic library with [`export_plugin!`]. Sandboxed workers written in Rust
//! can use [`worker::serve`] to speak the line protocol.

mod context;
mod contract;
mod factory;
mod fault;
pub mod protocol;
pub mod worker;

pub use context::PluginContext;
pub use contract::{Plugin, RouterHandle};
pub use factory::{
    ABI_VERSION, ABI_VERSION_SYMBOL, AbiVersionFn, CREATE_SYMBOL, CreateFn, PluginFactory,
};
pub use fault::PluginFault;
pub use protocol::normalize_response;

pub use async_trait::async_trait;
