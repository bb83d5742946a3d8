//! Error types for Palisade.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::state::PluginState;

/// Result type alias for Palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;

/// Main error type for Palisade.
#[derive(Debug, Error)]
pub enum PalisadeError {
    #[error("Invalid manifest for '{plugin}': {message}")]
    Manifest { plugin: String, message: String },

    #[error("Signature check failed for '{plugin}': {message}")]
    Signature { plugin: String, message: String },

    #[error("Security scan failed for '{plugin}': {}", .findings.join("; "))]
    Scan {
        plugin: String,
        findings: Vec<String>,
    },

    #[error("Plugin '{plugin}' did not answer within {timeout:?}")]
    IpcTimeout { plugin: String, timeout: Duration },

    #[error("Plugin '{plugin}' process is gone: {reason}")]
    IpcProcessDead { plugin: String, reason: String },

    #[error("Protocol error talking to '{plugin}': {message}")]
    IpcProtocol { plugin: String, message: String },

    #[error("Response from '{plugin}' exceeds {limit} bytes")]
    ResponseTooLarge { plugin: String, limit: usize },

    #[error("Rate limit exceeded for '{plugin}', retry after {retry_after:?}")]
    RateLimitExceeded {
        plugin: String,
        retry_after: Duration,
    },

    #[error("Disk quota exceeded for '{plugin}': {used_mb} MB used of {limit_mb} MB")]
    DiskQuotaExceeded {
        plugin: String,
        used_mb: u64,
        limit_mb: u64,
    },

    #[error("Failed to load plugin '{plugin}': {message}")]
    Load { plugin: String, message: String },

    #[error("Invalid state transition for '{plugin}': {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("Dependency cycle detected among: {}", .stuck.join(", "))]
    CycleDetected { stuck: Vec<String> },

    #[error("Plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("Plugin '{plugin}' is unavailable: {reason}")]
    Unavailable { plugin: String, reason: String },

    #[error("Plugin '{0}' is restarting")]
    Restarting(String),

    #[error("Plugin '{plugin}' timed out after {timeout:?}")]
    Timeout { plugin: String, timeout: Duration },

    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin {
        plugin: String,
        message: String,
        code: Option<String>,
    },

    #[error("All {attempts} attempts failed for '{plugin}': {last}")]
    RetriesExhausted {
        plugin: String,
        attempts: u32,
        last: Box<PalisadeError>,
    },

    #[error("Interpolation error: {message}")]
    Interpolation { message: String },

    #[error("Failed to read file: {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PalisadeError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::Manifest { .. } => "manifest_error",
            Self::Signature { .. } => "signature_error",
            Self::Scan { .. } => "scan_error",
            Self::IpcTimeout { .. } => "ipc_timeout",
            Self::IpcProcessDead { .. } => "ipc_process_dead",
            Self::IpcProtocol { .. } => "ipc_protocol_error",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::DiskQuotaExceeded { .. } => "disk_quota_exceeded",
            Self::Load { .. } => "load_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CycleDetected { .. } => "dependency_cycle",
            Self::PluginNotFound(_) => "not_found",
            Self::Unavailable { .. } => "unavailable",
            Self::Restarting(_) => "restarting",
            Self::Timeout { .. } => "timeout",
            Self::Plugin { code, .. } => code.as_deref().unwrap_or("plugin_error"),
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Interpolation { .. } => "interpolation_error",
            Self::FileRead { .. } | Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether a call that failed with this error may be attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::IpcTimeout { .. }
                | Self::IpcProcessDead { .. }
                | Self::IpcProtocol { .. }
                | Self::Restarting(_)
                | Self::Timeout { .. }
                | Self::Plugin { .. }
                | Self::Io(_)
        )
    }

    /// Renders this error as the structured response returned to callers.
    pub fn to_response(&self) -> Value {
        let mut response = json!({
            "status": "error",
            "msg": self.to_string(),
            "code": self.code(),
        });
        if let Self::RateLimitExceeded { retry_after, .. } = self {
            response["retry_after_seconds"] = json!(retry_after.as_secs_f64());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        let err = PalisadeError::PluginNotFound("billing".to_string());
        let response = err.to_response();
        assert_eq!(response["status"], "error");
        assert_eq!(response["code"], "not_found");
        assert_eq!(response["msg"], "Plugin 'billing' not found");
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = PalisadeError::RateLimitExceeded {
            plugin: "auth".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        let response = err.to_response();
        assert_eq!(response["code"], "rate_limited");
        assert_eq!(response["retry_after_seconds"], 1.5);
    }

    #[test]
    fn test_plugin_error_keeps_custom_code() {
        let err = PalisadeError::Plugin {
            plugin: "auth".to_string(),
            message: "bad token".to_string(),
            code: Some("unauthorized".to_string()),
        };
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(
            PalisadeError::IpcProcessDead {
                plugin: "p".to_string(),
                reason: "eof".to_string()
            }
            .is_retriable()
        );
        assert!(!PalisadeError::PluginNotFound("p".to_string()).is_retriable());
        assert!(
            !PalisadeError::Unavailable {
                plugin: "p".to_string(),
                reason: "failed".to_string()
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_cycle_message_lists_members() {
        let err = PalisadeError::CycleDetected {
            stuck: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected among: a, b");
    }
}
