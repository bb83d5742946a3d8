//! Plugin manifest model and per-mode defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a plugin's code is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// In-process, optionally signature-checked.
    Trusted,
    /// Isolated child process speaking the line protocol.
    Sandboxed,
    /// In-process with relaxed checks: no signature enforcement.
    Legacy,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Sandboxed => "sandboxed",
            Self::Legacy => "legacy",
        }
    }

    /// Whether plugins in this mode run inside the host process.
    pub fn is_in_process(&self) -> bool {
        matches!(self, Self::Trusted | Self::Legacy)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trusted" => Ok(Self::Trusted),
            "sandboxed" => Ok(Self::Sandboxed),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!(
                "unknown execution_mode '{other}' (expected trusted, sandboxed or legacy)"
            )),
        }
    }
}

/// Sliding-window call rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub calls: u32,
    pub period_seconds: f64,
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        seconds(self.period_seconds)
    }
}

/// Resource limits applied to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Per-call timeout.
    pub timeout_seconds: f64,
    /// Address-space hint handed to sandboxed workers.
    pub max_memory_mb: u64,
    /// Upper bound for the plugin directory size.
    pub max_disk_mb: u64,
    pub rate_limit: RateLimitConfig,
}

impl ResourceConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }
}

/// Periodic liveness probing of sandboxed workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        seconds(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds)
    }
}

/// Retry and restart backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub backoff_seconds: f64,
    pub max_backoff_seconds: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based): doubling, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(31) as i32);
        seconds((self.backoff_seconds * factor).min(self.max_backoff_seconds))
    }
}

/// Converts manifest seconds, saturating instead of panicking on huge values.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// Filesystem access policy. `["*"]` in `allowed_paths` means full access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub denied_paths: Vec<String>,
}

impl FilesystemPolicy {
    pub fn is_full_access(&self) -> bool {
        self.allowed_paths.iter().any(|p| p == "*")
    }

    /// Whether `path` may be touched by a plugin living in `plugin_dir`.
    ///
    /// The plugin's own directory is always allowed unless explicitly denied.
    pub fn permits(&self, plugin_dir: &Path, path: &Path) -> bool {
        if self.denied_paths.iter().any(|d| path.starts_with(d)) {
            return false;
        }
        if self.is_full_access() || path.starts_with(plugin_dir) {
            return true;
        }
        self.allowed_paths.iter().any(|a| path.starts_with(a))
    }
}

/// Mode-dependent default values a manifest is overlaid onto.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestDefaults {
    pub resources: ResourceConfig,
    pub health_check: HealthCheckConfig,
    pub retry: RetryPolicy,
    pub max_restarts: u32,
    pub filesystem: FilesystemPolicy,
}

impl ManifestDefaults {
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Trusted | ExecutionMode::Legacy => Self {
                resources: ResourceConfig {
                    timeout_seconds: 300.0,
                    max_memory_mb: 4096,
                    max_disk_mb: 10240,
                    rate_limit: RateLimitConfig {
                        calls: 1000,
                        period_seconds: 60.0,
                    },
                },
                health_check: HealthCheckConfig {
                    enabled: false,
                    interval_seconds: 30.0,
                    timeout_seconds: 5.0,
                },
                retry: RetryPolicy {
                    max_attempts: 1,
                    backoff_seconds: 0.5,
                    max_backoff_seconds: 10.0,
                },
                max_restarts: 0,
                filesystem: FilesystemPolicy {
                    allowed_paths: vec!["*".to_string()],
                    denied_paths: Vec::new(),
                },
            },
            ExecutionMode::Sandboxed => Self {
                resources: ResourceConfig {
                    timeout_seconds: 30.0,
                    max_memory_mb: 256,
                    max_disk_mb: 100,
                    rate_limit: RateLimitConfig {
                        calls: 100,
                        period_seconds: 60.0,
                    },
                },
                health_check: HealthCheckConfig {
                    enabled: true,
                    interval_seconds: 10.0,
                    timeout_seconds: 5.0,
                },
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff_seconds: 0.5,
                    max_backoff_seconds: 10.0,
                },
                max_restarts: 3,
                filesystem: FilesystemPolicy::default(),
            },
        }
    }
}

fn default_source_dir() -> String {
    "src".to_string()
}

/// A fully validated plugin manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name.
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    pub execution_mode: ExecutionMode,

    /// Code module, relative to the plugin directory.
    pub entry_point: String,

    /// Plugins that must be active before this one.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Extra modules the scanner accepts for this plugin.
    #[serde(default)]
    pub allowed_imports: Vec<String>,

    /// Subtree that is scanned and signed.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    pub resources: ResourceConfig,
    pub health_check: HealthCheckConfig,
    pub retry: RetryPolicy,
    pub max_restarts: u32,
    pub filesystem: FilesystemPolicy,

    /// Resolved environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Load the plugin-local `.env` file before resolving `env`.
    #[serde(default)]
    pub inject_env: bool,

    #[serde(default)]
    pub signature_required: bool,

    /// Free-form plugin configuration.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// Directory the manifest was read from.
    #[serde(skip)]
    pub directory: PathBuf,
}

impl PluginManifest {
    /// Absolute path of the entry point.
    pub fn entry_path(&self) -> PathBuf {
        self.directory.join(&self.entry_point)
    }

    /// Absolute path of the scanned and signed source subtree.
    pub fn source_path(&self) -> PathBuf {
        self.directory.join(&self.source_dir)
    }

    /// Whether activation must present a valid signature.
    pub fn needs_signature(&self, strict_trust: bool) -> bool {
        self.execution_mode == ExecutionMode::Trusted && (strict_trust || self.signature_required)
    }
}
