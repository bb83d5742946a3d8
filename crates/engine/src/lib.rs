//! Palisade Engine - Loading, supervision and call routing for plugins.

mod code_loader;
mod config;
mod dag;
mod handle;
mod ipc;
mod lifecycle;
pub mod limits;
mod loader;
mod sandbox;
mod scheduler;
mod spawn;
mod supervisor;

pub use code_loader::{CodeLoader, DylibLoader, LoadedCode, LoadedLibrary, StaticRegistry};
pub use config::{CONFIG_FILE, RuntimeConfig, WorkerCommand};
pub use dag::DependencyGraph;
pub use handle::{PluginHandle, PluginRuntime, PluginStatus, StateCell};
pub use ipc::IpcChannel;
pub use lifecycle::TrustedPlugin;
pub use loader::{Discovery, LoadReport, PluginLoader, discover};
pub use sandbox::{SandboxState, SandboxSupervisor};
pub use scheduler::{Scheduler, Wave};
pub use spawn::spawn_worker;
pub use supervisor::{Supervisor, SupervisorBuilder};
