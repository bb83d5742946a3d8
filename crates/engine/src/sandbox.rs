//! Supervision of sandboxed worker processes.
//!
//! A sandbox owns one child process and the [`IpcChannel`] to it. Two
//! watchers run beside a healthy worker: a wait loop noticing process exit
//! and an optional health loop pinging on an interval. Either one, or a call
//! observing a dead pipe, starts crash handling. Only one crash episode runs
//! at a time; it retries the worker up to `max_restarts` times with backoff
//! and then gives up for good.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use palisade_core::{EventBus, PalisadeError, PluginEvent, PluginManifest, PluginState, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::handle::StateCell;
use crate::ipc::IpcChannel;
use crate::limits::{DiskWatcher, resident_memory_mb};
use crate::spawn::spawn_worker;

/// How often the wait loop polls the child.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// How long to wait for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Stderr lines attached to crash reports.
const CRASH_TAIL_LINES: usize = 20;

/// State of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervises the worker of one sandboxed plugin.
pub struct SandboxSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    manifest: PluginManifest,
    config: Arc<RuntimeConfig>,
    lifecycle: StateCell,
    events: EventBus,
    disk: DiskWatcher,
    state: Mutex<SandboxState>,
    child: tokio::sync::Mutex<Option<Child>>,
    /// Channel of the current worker, tagged with its generation.
    channel: RwLock<Option<(u64, Arc<IpcChannel>)>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    recovering: AtomicBool,
    /// Crash reported while an episode was finishing.
    deferred_crash: Mutex<Option<(u64, String)>>,
    stopping: AtomicBool,
    generation: AtomicU64,
    restarts: AtomicU32,
    pid: AtomicU32,
    stderr: Arc<Mutex<VecDeque<String>>>,
    last_error: Mutex<Option<String>>,
}

impl SandboxSupervisor {
    pub fn new(
        manifest: PluginManifest,
        config: Arc<RuntimeConfig>,
        lifecycle: StateCell,
        events: EventBus,
    ) -> Self {
        let disk = DiskWatcher::new(&manifest.directory, config.disk_poll_interval());
        Self {
            inner: Arc::new(Inner {
                manifest,
                config,
                lifecycle,
                events,
                disk,
                state: Mutex::new(SandboxState::Stopped),
                child: tokio::sync::Mutex::new(None),
                channel: RwLock::new(None),
                watchers: Mutex::new(Vec::new()),
                recovery: Mutex::new(None),
                recovering: AtomicBool::new(false),
                deferred_crash: Mutex::new(None),
                stopping: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
                pid: AtomicU32::new(0),
                stderr: Arc::new(Mutex::new(VecDeque::new())),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Spawns the worker and waits for its first ping.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.stopping.store(false, Ordering::SeqCst);
        inner.set_state(SandboxState::Starting);

        match inner.launch().await {
            Ok(generation) => {
                inner.set_state(SandboxState::Running);
                Inner::start_watchers(inner, generation);
                info!(plugin = %inner.manifest.name, pid = ?self.pid(), "sandbox running");
                Ok(())
            }
            Err(e) => {
                inner.teardown().await;
                inner.record_error(e.to_string());
                inner.set_state(SandboxState::Failed);
                Err(e)
            }
        }
    }

    /// Forwards one call to the worker.
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        let inner = &self.inner;
        let plugin = &inner.manifest.name;

        match inner.state() {
            SandboxState::Running => {}
            SandboxState::Restarting => return Err(PalisadeError::Restarting(plugin.clone())),
            other => {
                return Err(PalisadeError::Unavailable {
                    plugin: plugin.clone(),
                    reason: format!("sandbox is {other}"),
                });
            }
        }

        inner
            .disk
            .check(plugin, inner.manifest.resources.max_disk_mb)?;

        let current = inner.channel.read().clone();
        let Some((generation, channel)) = current else {
            return Err(PalisadeError::Restarting(plugin.clone()));
        };

        let result = channel
            .call(action, payload, inner.manifest.resources.timeout())
            .await;
        if let Err(e @ PalisadeError::IpcProcessDead { .. }) = &result {
            Inner::trigger_crash(inner, generation, e.to_string());
        }
        result
    }

    /// Stops the watchers and any crash handling, then kills the worker.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::SeqCst);

        let recovery = inner.recovery.lock().take();
        if let Some(task) = recovery {
            task.abort();
            let _ = task.await;
        }
        inner.recovering.store(false, Ordering::SeqCst);
        inner.deferred_crash.lock().take();

        inner.teardown().await;
        inner.set_state(SandboxState::Stopped);
        info!(plugin = %inner.manifest.name, "sandbox stopped");
    }

    pub fn state(&self) -> SandboxState {
        self.inner.state()
    }

    /// Respawn attempts made since creation.
    pub fn restart_count(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Resident memory of the worker, where the platform reports it.
    pub fn memory_mb(&self) -> Option<u64> {
        self.pid().and_then(resident_memory_mb)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Most recent stderr lines of the worker.
    pub fn stderr_tail(&self, lines: usize) -> Vec<String> {
        self.inner.stderr_tail(lines)
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.inner.manifest
    }
}

impl Inner {
    fn state(&self) -> SandboxState {
        *self.state.lock()
    }

    fn set_state(&self, next: SandboxState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(plugin = %self.manifest.name, from = %previous, to = %next, "sandbox state");
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn stderr_tail(&self, lines: usize) -> Vec<String> {
        let buffer = self.stderr.lock();
        let skip = buffer.len().saturating_sub(lines);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Spawns a worker, pings it, and installs it as current.
    async fn launch(&self) -> Result<u64> {
        let plugin = &self.manifest.name;
        let mut child = spawn_worker(
            &self.manifest,
            &self.config.worker,
            &self.config.inherited_env,
        )?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PalisadeError::Load {
                plugin: plugin.clone(),
                message: "worker stdio was not captured".to_string(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            let task = tokio::spawn(capture_stderr(
                plugin.clone(),
                stderr,
                Arc::clone(&self.stderr),
                self.config.stderr_buffer_lines,
            ));
            self.watchers.lock().push(task);
        }

        let channel = Arc::new(IpcChannel::new(
            plugin.clone(),
            stdout,
            stdin,
            self.config.max_response_bytes,
        ));

        if let Err(e) = channel.ping(self.manifest.health_check.timeout()).await {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            return Err(PalisadeError::Load {
                plugin: plugin.clone(),
                message: format!("worker did not answer the startup ping: {e}"),
            });
        }

        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
        *self.child.lock().await = Some(child);
        *self.channel.write() = Some((generation, channel));
        Ok(generation)
    }

    fn start_watchers(self: &Arc<Self>, generation: u64) {
        let mut watchers = self.watchers.lock();
        watchers.push(tokio::spawn(wait_loop(Arc::downgrade(self), generation)));

        let health = &self.manifest.health_check;
        if health.enabled {
            watchers.push(tokio::spawn(health_loop(
                Arc::downgrade(self),
                generation,
                health.interval(),
                health.timeout(),
            )));
        }
    }

    /// Starts crash handling unless one episode is already running or the
    /// report is about an older worker.
    fn trigger_crash(self: &Arc<Self>, generation: u64, reason: String) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(plugin = %self.manifest.name, generation, "ignoring crash of a replaced worker");
            return;
        }
        if self.recovering.swap(true, Ordering::SeqCst) {
            debug!(plugin = %self.manifest.name, "crash handling already in flight");
            *self.deferred_crash.lock() = Some((generation, reason));
            return;
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.recover(reason).await;
            Self::finish_recovery(&inner);
        });
        *self.recovery.lock() = Some(task);
    }

    /// Ends a crash episode and replays a crash reported while it ran.
    fn finish_recovery(self: &Arc<Self>) {
        self.recovering.store(false, Ordering::SeqCst);
        let deferred = self.deferred_crash.lock().take();
        if let Some((generation, reason)) = deferred {
            Self::trigger_crash(self, generation, reason);
        }
    }

    async fn recover(self: &Arc<Self>, reason: String) {
        let plugin = self.manifest.name.clone();
        warn!(plugin = %plugin, %reason, "worker crashed");
        for line in self.stderr_tail(CRASH_TAIL_LINES) {
            warn!(plugin = %plugin, "worker stderr: {line}");
        }
        self.record_error(reason.clone());
        self.events.publish(PluginEvent::Crashed {
            plugin: plugin.clone(),
            reason,
        });

        self.set_state(SandboxState::Restarting);
        self.lifecycle.advance_lenient(PluginState::Restarting);
        self.teardown().await;

        let max_restarts = self.manifest.max_restarts;
        for attempt in 0..max_restarts {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(self.manifest.retry.backoff_for(attempt)).await;

            self.restarts.fetch_add(1, Ordering::SeqCst);
            warn!(plugin = %plugin, attempt = attempt + 1, max_restarts, "restarting worker");

            match self.launch().await {
                Ok(generation) => {
                    self.set_state(SandboxState::Running);
                    self.lifecycle.advance_lenient(PluginState::Running);
                    Self::start_watchers(self, generation);
                    self.events.publish(PluginEvent::Restarted {
                        plugin: plugin.clone(),
                        attempt: attempt + 1,
                    });
                    info!(plugin = %plugin, attempt = attempt + 1, "worker restarted");
                    return;
                }
                Err(e) => {
                    warn!(plugin = %plugin, attempt = attempt + 1, error = %e, "restart attempt failed");
                    self.record_error(e.to_string());
                    self.teardown().await;
                }
            }
        }

        error!(plugin = %plugin, max_restarts, "worker failed permanently");
        self.set_state(SandboxState::Failed);
        self.lifecycle.advance_lenient(PluginState::Failed);
    }

    /// Cancels and joins the watchers, then kills the worker.
    async fn teardown(&self) {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in &watchers {
            watcher.abort();
        }
        for watcher in watchers {
            let _ = watcher.await;
        }

        self.channel.write().take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(plugin = %self.manifest.name, error = %e, "kill failed");
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                warn!(plugin = %self.manifest.name, "worker was not reaped after kill");
            }
        }
        self.pid.store(0, Ordering::SeqCst);
    }
}

async fn wait_loop(weak: Weak<Inner>, generation: u64) {
    loop {
        tokio::time::sleep(WAIT_POLL).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let exit = {
            let mut child = inner.child.lock().await;
            match child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => Some(format!("worker exited ({status})")),
                    Ok(None) => None,
                    Err(e) => Some(format!("failed to poll worker: {e}")),
                },
                None => return,
            }
        };

        if let Some(reason) = exit {
            Inner::trigger_crash(&inner, generation, reason);
            return;
        }
    }
}

async fn health_loop(weak: Weak<Inner>, generation: u64, interval: Duration, timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let current = inner.channel.read().clone();
        let Some((_, channel)) = current else {
            return;
        };

        if let Err(e) = channel.ping(timeout).await {
            Inner::trigger_crash(&inner, generation, format!("health check failed: {e}"));
            return;
        }
        debug!(plugin = %inner.manifest.name, "health check passed");
    }
}

async fn capture_stderr(
    plugin: String,
    stderr: ChildStderr,
    buffer: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin, "stderr: {line}");
        let mut buffer = buffer.lock();
        if buffer.len() >= capacity.max(1) {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }
}
