//! Palisade Core - Core types shared across the Palisade plugin runtime.

mod error;
mod event;
pub mod hook;
pub mod interpolation;
mod manifest;
mod service;
mod state;

pub use error::{PalisadeError, Result};
pub use event::{EventBus, PluginEvent};
pub use hook::{HookManager, HookPayload};
pub use interpolation::{InterpolationContext, interpolate};
pub use manifest::{
    ExecutionMode, FilesystemPolicy, HealthCheckConfig, ManifestDefaults, PluginManifest,
    RateLimitConfig, ResourceConfig, RetryPolicy,
};
pub use service::{FlushOutcome, HOST_OWNER, Service, Services, SharedServiceMap};
pub use state::{PluginState, StateMachine, StateTransition};
