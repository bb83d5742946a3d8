//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use palisade_core::{PalisadeError, Result};
use palisade_security::SigningKey;
use serde::{Deserialize, Serialize};

/// Config file looked up in the plugin root.
pub const CONFIG_FILE: &str = "palisade.json";

/// Host variables passed through to sandboxed workers by default.
pub const DEFAULT_INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG"];

/// Program and arguments used to start a sandboxed worker.
///
/// The plugin directory is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Parses a whitespace-separated command line such as `python3 -m palisade_worker`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("python3").with_arg("-m").with_arg("palisade_worker")
    }
}

/// Settings shared by the loader, lifecycle managers and sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory whose subdirectories are plugins.
    pub plugin_root: PathBuf,

    pub worker: WorkerCommand,

    /// Require a valid signature for every trusted plugin.
    pub strict_trust: bool,

    #[serde(skip)]
    pub signing_key: Option<SigningKey>,

    /// Where dynamic libraries are copied before loading.
    pub scratch_dir: PathBuf,

    /// Largest accepted worker response line.
    pub max_response_bytes: usize,

    pub disk_poll_interval_ms: u64,

    /// Worker stderr lines kept for crash reports.
    pub stderr_buffer_lines: usize,

    /// Activations running at once within a wave.
    pub max_parallelism: usize,

    /// Host variables copied into worker environments.
    pub inherited_env: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("plugins"),
            worker: WorkerCommand::default(),
            strict_trust: false,
            signing_key: None,
            scratch_dir: default_scratch_dir(),
            max_response_bytes: 1024 * 1024,
            disk_poll_interval_ms: 5_000,
            stderr_buffer_lines: 200,
            max_parallelism: num_cpus::get(),
            inherited_env: DEFAULT_INHERITED_ENV
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("palisade")
        .join("libs")
}

impl RuntimeConfig {
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PalisadeError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reads `palisade.json` from `plugin_root` when present.
    pub fn discover(plugin_root: &Path) -> Result<Self> {
        let path = plugin_root.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.plugin_root = plugin_root.to_path_buf();
        Ok(config)
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_strict_trust(mut self, strict: bool) -> Self {
        self.strict_trust = strict;
        self
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes.max(1);
        self
    }

    pub fn with_disk_poll_interval(mut self, interval: Duration) -> Self {
        self.disk_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max.max(1);
        self
    }

    pub fn disk_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disk_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_response_bytes, 1024 * 1024);
        assert_eq!(config.worker.program, "python3");
        assert_eq!(config.worker.args, vec!["-m", "palisade_worker"]);
        assert!(config.max_parallelism >= 1);
        assert!(config.inherited_env.contains(&"PATH".to_string()));
    }

    #[test]
    fn test_discover_reads_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"strict_trust": true, "worker": {"program": "/bin/sh", "args": ["w.sh"]}}"#,
        )
        .unwrap();

        let config = RuntimeConfig::discover(dir.path()).unwrap();
        assert!(config.strict_trust);
        assert_eq!(config.worker, WorkerCommand::new("/bin/sh").with_arg("w.sh"));
        assert_eq!(config.plugin_root, dir.path());
        assert_eq!(config.stderr_buffer_lines, 200);
    }

    #[test]
    fn test_parse_worker_command() {
        let worker = WorkerCommand::parse("node  worker.js --fast").unwrap();
        assert_eq!(worker.program, "node");
        assert_eq!(worker.args, vec!["worker.js", "--fast"]);
        assert!(WorkerCommand::parse("   ").is_none());
    }
}
