//! Per-plugin resource governance: call rate, disk usage, resident memory.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use palisade_core::{PalisadeError, RateLimitConfig, Result};
use parking_lot::Mutex;
use walkdir::WalkDir;

/// Sliding-window call limiter keyed by plugin name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call for `plugin`, or fails with `RateLimitExceeded`.
    pub fn check(&self, plugin: &str, limit: &RateLimitConfig) -> Result<()> {
        self.check_at(plugin, limit, Instant::now())
    }

    /// Same as [`RateLimiter::check`] at an explicit instant.
    pub fn check_at(&self, plugin: &str, limit: &RateLimitConfig, now: Instant) -> Result<()> {
        let period = limit.period();
        let mut windows = self.windows.lock();
        let window = windows.entry(plugin.to_string()).or_default();

        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= period {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit.calls as usize {
            let retry_after = window
                .front()
                .map(|oldest| period.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(period);
            return Err(PalisadeError::RateLimitExceeded {
                plugin: plugin.to_string(),
                retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Forgets the window of `plugin`.
    pub fn reset(&self, plugin: &str) {
        self.windows.lock().remove(plugin);
    }

    /// Calls currently counted for `plugin`.
    pub fn in_window(&self, plugin: &str) -> usize {
        self.windows.lock().get(plugin).map_or(0, VecDeque::len)
    }
}

/// Polls the size of a plugin directory, caching the result.
#[derive(Debug)]
pub struct DiskWatcher {
    directory: PathBuf,
    poll_interval: Duration,
    cached: Mutex<Option<(Instant, u64)>>,
}

impl DiskWatcher {
    pub fn new(directory: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            directory: directory.into(),
            poll_interval,
            cached: Mutex::new(None),
        }
    }

    /// Bytes used under the directory, recomputed at most once per poll interval.
    pub fn usage_bytes(&self) -> u64 {
        let mut cached = self.cached.lock();
        if let Some((at, bytes)) = *cached
            && at.elapsed() < self.poll_interval
        {
            return bytes;
        }
        let bytes = directory_size(&self.directory);
        *cached = Some((Instant::now(), bytes));
        bytes
    }

    /// Fails with `DiskQuotaExceeded` when usage is above `limit_mb`.
    pub fn check(&self, plugin: &str, limit_mb: u64) -> Result<()> {
        let used_mb = self.usage_bytes().div_ceil(1024 * 1024);
        if used_mb > limit_mb {
            return Err(PalisadeError::DiskQuotaExceeded {
                plugin: plugin.to_string(),
                used_mb,
                limit_mb,
            });
        }
        Ok(())
    }
}

/// Total size of regular files below `dir`. Unreadable entries are ignored.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Resident set size of process `pid` in MiB.
#[cfg(target_os = "linux")]
pub fn resident_memory_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Resident set size of process `pid` in MiB.
#[cfg(not(target_os = "linux"))]
pub fn resident_memory_mb(_pid: u32) -> Option<u64> {
    None
}
