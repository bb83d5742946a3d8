//! Plugin-side error type.

use thiserror::Error;

/// Error returned by plugin code.
#[derive(Debug, Error)]
pub enum PluginFault {
    /// Generic failure with an optional machine code.
    #[error("{message}")]
    Failed {
        message: String,
        code: Option<String>,
    },

    /// A service the plugin depends on is not registered.
    #[error("Missing service '{0}'")]
    MissingService(String),

    /// The payload did not have the expected shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The action is not handled by this plugin.
    #[error("Unknown action '{0}'")]
    UnknownAction(String),
}

impl PluginFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Machine-readable code reported to callers.
    pub fn code(&self) -> &str {
        match self {
            Self::Failed { code, .. } => code.as_deref().unwrap_or("plugin_error"),
            Self::MissingService(_) => "missing_service",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::UnknownAction(_) => "unknown_action",
        }
    }
}

impl From<serde_json::Error> for PluginFault {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
