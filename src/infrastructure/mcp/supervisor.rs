//! Process supervision for managed MCP servers
//!
//! The supervisor keeps at most one live child process per configured server
//! name. First use of a name runs its build step (if any), spawns the child
//! with piped stdio, and waits for readiness; concurrent callers for the same
//! name wait on the same in-flight attempt instead of double-spawning.
//! Unexpected exits are retried with exponential backoff up to a ceiling,
//! after which the server is Terminated until an explicit reset.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::domain::models::{ProcessState, Registry, ServerDefinition, ServerStatus, SupervisorConfig};
use crate::infrastructure::mcp::error::{BridgeError, Result};
use crate::infrastructure::mcp::framing::FramedClient;

const STDERR_TAIL_BYTES: usize = 4096;

/// Handle to one live (or just-exited) managed process.
///
/// Callers get an `Arc` to this; the `tokio::process::Child` itself is owned
/// by the exit-watcher task and never leaves the supervisor.
pub struct ProcessHandle {
    name: String,
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    client: FramedClient,
    stderr_tail: Arc<StdMutex<String>>,
    consecutive_timeouts: AtomicU32,
    last_healthy: StdMutex<Option<Instant>>,
    exit_flag: Arc<AtomicBool>,
    exited: Arc<Notify>,
}

impl ProcessHandle {
    /// Server name this process was spawned for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the child was alive at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Monotonic spawn counter; distinguishes incarnations of one name.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the process has exited or closed its output stream.
    pub fn is_closed(&self) -> bool {
        self.has_exited() || self.client.is_closed()
    }

    /// Whether the exit watcher has reaped the process.
    pub fn has_exited(&self) -> bool {
        self.exit_flag.load(Ordering::SeqCst)
    }

    /// Consecutive request timeouts since the last successful response.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    /// Last ~4KB of the child's stderr.
    pub fn stderr_tail(&self) -> String {
        lock_ignore_poison(&self.stderr_tail).clone()
    }

    /// Send a structured JSON-RPC request over the child's stdio.
    pub async fn request(&self, payload: &Value, timeout: Duration) -> Result<Value> {
        let result = self.client.send(payload, timeout).await;
        self.track(&result);
        result
    }

    /// Send raw JSON-RPC text over the child's stdio, forwarded verbatim.
    pub async fn request_raw(&self, raw: &str, timeout: Duration) -> Result<Value> {
        let result = self.client.send_raw(raw, timeout).await;
        self.track(&result);
        result
    }

    fn track(&self, result: &Result<Value>) {
        match result {
            Ok(_) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                self.mark_healthy();
            }
            Err(BridgeError::Timeout(_)) => {
                self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {}
        }
    }

    fn mark_healthy(&self) {
        *lock_ignore_poison(&self.last_healthy) = Some(Instant::now());
    }

    fn last_healthy_secs_ago(&self) -> Option<u64> {
        lock_ignore_poison(&self.last_healthy).map(|at| at.elapsed().as_secs())
    }

    /// Resolve once the exit watcher has reaped the process.
    pub async fn wait_exited(&self) {
        loop {
            let notified = self.exited.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_exited() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

/// One spawn attempt that any number of callers can wait on.
struct Attempt {
    restart: bool,
    done: Notify,
    result: StdMutex<Option<Result<Arc<ProcessHandle>>>>,
}

impl Attempt {
    fn new(restart: bool) -> Arc<Self> {
        Arc::new(Self {
            restart,
            done: Notify::new(),
            result: StdMutex::new(None),
        })
    }

    fn finish(&self, result: Result<Arc<ProcessHandle>>) {
        *lock_ignore_poison(&self.result) = Some(result);
        self.done.notify_waiters();
    }

    fn result(&self) -> Option<Result<Arc<ProcessHandle>>> {
        lock_ignore_poison(&self.result).clone()
    }

    async fn wait(&self) -> Result<Arc<ProcessHandle>> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, so a finish() landing
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }
}

enum SlotState {
    Idle,
    Starting(Arc<Attempt>),
    Running(Arc<ProcessHandle>),
    Terminated { reason: String },
}

struct Slot {
    state: SlotState,
    restart_count: u32,
    backoff: ExponentialBackoff,
}

impl Slot {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            state: SlotState::Idle,
            restart_count: 0,
            backoff: new_backoff(config),
        }
    }
}

fn new_backoff(config: &SupervisorConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(config.initial_backoff_ms),
        current_interval: Duration::from_millis(config.initial_backoff_ms),
        max_interval: Duration::from_millis(config.max_backoff_ms),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

struct Inner {
    registry: Registry,
    config: SupervisorConfig,
    workdir: PathBuf,
    slots: StdMutex<HashMap<String, Slot>>,
    built: tokio::sync::Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
    generation: AtomicU64,
}

/// Supervisor owning the name → process table.
///
/// Cheap to clone; all clones share one table, so independent instances in
/// tests are just independent `Supervisor::new` calls.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor over a registry of server definitions.
    pub fn new(registry: Registry, config: SupervisorConfig, workdir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                workdir,
                slots: StdMutex::new(HashMap::new()),
                built: tokio::sync::Mutex::new(HashSet::new()),
                shutting_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The server registry this supervisor was built with.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Return a handle to a running process for `name`, spawning it first if
    /// necessary. Concurrent callers for the same name share one attempt.
    pub async fn ensure_running(&self, name: &str) -> Result<Arc<ProcessHandle>> {
        let def = self
            .inner
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownServer(name.to_string()))?;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        let attempt = {
            let mut slots = self.lock_slots();
            let slot = slots
                .entry(name.to_string())
                .or_insert_with(|| Slot::new(&self.inner.config));
            match &slot.state {
                SlotState::Running(handle) if !handle.is_closed() => return Ok(handle.clone()),
                SlotState::Terminated { reason } => {
                    return Err(BridgeError::CrashLoop {
                        name: name.to_string(),
                        reason: reason.clone(),
                    })
                }
                SlotState::Starting(attempt) => attempt.clone(),
                SlotState::Idle | SlotState::Running(_) => {
                    let attempt = Attempt::new(false);
                    slot.state = SlotState::Starting(attempt.clone());
                    self.spawn_attempt_task(name, def, attempt.clone(), None);
                    attempt
                }
            }
        };

        attempt.wait().await
    }

    /// Restart clears the timeout/health strike state by replacing the
    /// process; used by the health monitor and the consecutive-timeout
    /// policy. A server that is not currently Running is left alone.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let def = self
            .inner
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownServer(name.to_string()))?;

        let (handle, attempt) = {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(name) else {
                return Ok(());
            };
            let SlotState::Running(handle) = &slot.state else {
                return Ok(());
            };
            let handle = handle.clone();
            let attempt = Attempt::new(true);
            slot.state = SlotState::Starting(attempt.clone());
            (handle, attempt)
        };

        info!(server = name, "restarting MCP server");
        terminate_process(&handle, self.inner.config.shutdown_grace()).await;
        self.run_attempt(name, &def, &attempt, None).await;
        match attempt.result() {
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }

    /// Handle to the live process for `name`, if one is currently Running.
    pub fn running_handle(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        let slots = self.lock_slots();
        match slots.get(name).map(|slot| &slot.state) {
            Some(SlotState::Running(handle)) if !handle.is_closed() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Clear a Terminated slot so the next request may spawn again.
    pub fn reset(&self, name: &str) -> Result<()> {
        if !self.inner.registry.contains(name) {
            return Err(BridgeError::UnknownServer(name.to_string()));
        }
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(name) {
            if matches!(slot.state, SlotState::Terminated { .. }) {
                info!(server = name, "clearing terminated state");
                slot.state = SlotState::Idle;
            }
            slot.restart_count = 0;
            slot.backoff = new_backoff(&self.inner.config);
        }
        Ok(())
    }

    /// Point-in-time state of every configured server.
    pub fn status(&self) -> Vec<ServerStatus> {
        let slots = self.lock_slots();
        let mut statuses: Vec<ServerStatus> = self
            .inner
            .registry
            .names()
            .map(|name| match slots.get(name) {
                None => ServerStatus {
                    name: name.to_string(),
                    state: ProcessState::Stopped,
                    restart_count: 0,
                    pid: None,
                    uptime_secs: None,
                    last_healthy_secs_ago: None,
                },
                Some(slot) => {
                    let state = match &slot.state {
                        SlotState::Idle => ProcessState::Stopped,
                        SlotState::Starting(attempt) if attempt.restart => ProcessState::Restarting,
                        SlotState::Starting(_) => ProcessState::Starting,
                        SlotState::Running(handle) if handle.consecutive_timeouts() > 0 => {
                            ProcessState::Degraded
                        }
                        SlotState::Running(_) => ProcessState::Running,
                        SlotState::Terminated { .. } => ProcessState::Terminated,
                    };
                    let (pid, uptime_secs, last_healthy_secs_ago) = match &slot.state {
                        SlotState::Running(handle) => (
                            handle.pid,
                            Some(handle.started_at.elapsed().as_secs()),
                            handle.last_healthy_secs_ago(),
                        ),
                        _ => (None, None, None),
                    };
                    ServerStatus {
                        name: name.to_string(),
                        state,
                        restart_count: slot.restart_count,
                        pid,
                        uptime_secs,
                        last_healthy_secs_ago,
                    }
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop every managed process: SIGTERM, wait out the grace deadline,
    /// force-kill stragglers. Further `ensure_running` calls fail.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<Arc<ProcessHandle>> = {
            let mut slots = self.lock_slots();
            slots
                .values_mut()
                .filter_map(|slot| {
                    match std::mem::replace(&mut slot.state, SlotState::Idle) {
                        SlotState::Running(handle) => Some(handle),
                        // Keep the terminal marker for post-mortem status.
                        SlotState::Terminated { reason } => {
                            slot.state = SlotState::Terminated { reason };
                            None
                        }
                        _ => None,
                    }
                })
                .collect()
        };

        if handles.is_empty() {
            info!("no managed processes to stop");
            return;
        }

        let grace = self.inner.config.shutdown_grace();
        futures::future::join_all(handles.iter().map(|handle| {
            info!(server = %handle.name, pid = ?handle.pid, "stopping MCP server");
            terminate_process(handle, grace)
        }))
        .await;
        info!("all managed processes stopped");
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_attempt_task(
        &self,
        name: &str,
        def: ServerDefinition,
        attempt: Arc<Attempt>,
        delay: Option<Duration>,
    ) {
        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            supervisor.run_attempt(&name, &def, &attempt, delay).await;
        });
    }

    /// Run one spawn attempt to completion and publish its outcome to the
    /// slot and to every waiter. Detached from callers so a caller timing
    /// out mid-spawn cannot leave the slot stuck in Starting.
    async fn run_attempt(
        &self,
        name: &str,
        def: &ServerDefinition,
        attempt: &Arc<Attempt>,
        delay: Option<Duration>,
    ) {
        if let Some(delay) = delay {
            debug!(server = name, delay_ms = delay.as_millis() as u64, "waiting out restart backoff");
            tokio::time::sleep(delay).await;
        }

        let mut result = self.build_and_spawn(name, def).await;

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            if let Ok(handle) = &result {
                let handle = handle.clone();
                let grace = self.inner.config.shutdown_grace();
                tokio::spawn(async move {
                    terminate_process(&handle, grace).await;
                });
            }
            result = Err(BridgeError::ShuttingDown);
        }

        {
            let mut slots = self.lock_slots();
            let Some(slot) = slots.get_mut(name) else {
                attempt.finish(result);
                return;
            };
            match &result {
                Ok(handle) => {
                    slot.state = SlotState::Running(handle.clone());
                }
                Err(BridgeError::ShuttingDown) => {
                    slot.state = SlotState::Idle;
                }
                Err(err) => {
                    slot.restart_count += 1;
                    warn!(
                        server = name,
                        error = %err,
                        failures = slot.restart_count,
                        "failed to start MCP server"
                    );
                    if slot.restart_count >= self.inner.config.max_restarts {
                        let reason = format!("{} consecutive failed starts", slot.restart_count);
                        error!(server = name, %reason, "crash-loop ceiling reached; server terminated until reset");
                        slot.state = SlotState::Terminated { reason };
                    } else {
                        slot.state = SlotState::Idle;
                    }
                }
            }
        }
        attempt.finish(result);
    }

    /// Exit watcher entry point: applies the restart policy for a process
    /// that was Running when it exited.
    fn report_exit(&self, name: &str, generation: u64, status: Option<std::process::ExitStatus>) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(name) else {
            return;
        };
        let uptime = match &slot.state {
            SlotState::Running(handle) if handle.generation == generation => {
                handle.started_at.elapsed()
            }
            // A stale exit from a generation that was already replaced.
            _ => return,
        };

        if uptime >= self.inner.config.stable_uptime() {
            slot.restart_count = 0;
            slot.backoff = new_backoff(&self.inner.config);
        }
        slot.restart_count += 1;

        let rendered = status.map_or_else(|| "unknown".to_string(), |s| s.to_string());
        warn!(
            server = name,
            status = %rendered,
            uptime_secs = uptime.as_secs(),
            exits = slot.restart_count,
            "managed process exited unexpectedly"
        );

        if slot.restart_count >= self.inner.config.max_restarts {
            let reason = format!(
                "exited {} times in a row (last status: {rendered})",
                slot.restart_count
            );
            error!(server = name, %reason, "crash-loop ceiling reached; server terminated until reset");
            slot.state = SlotState::Terminated { reason };
            return;
        }

        let delay = slot
            .backoff
            .next_backoff()
            .unwrap_or_else(|| Duration::from_millis(self.inner.config.max_backoff_ms));
        let attempt = Attempt::new(true);
        slot.state = SlotState::Starting(attempt.clone());
        info!(
            server = name,
            delay_ms = delay.as_millis() as u64,
            exits = slot.restart_count,
            "scheduling restart"
        );
        drop(slots);

        if let Some(def) = self.inner.registry.get(name).cloned() {
            self.spawn_attempt_task(name, def, attempt, Some(delay));
        }
    }

    async fn build_and_spawn(
        &self,
        name: &str,
        def: &ServerDefinition,
    ) -> Result<Arc<ProcessHandle>> {
        self.run_build_step(name, def).await?;

        if let Some(min) = def
            .runtime_config
            .as_ref()
            .and_then(|runtime| runtime.min_version.as_deref())
        {
            debug!(server = name, min_version = min, "runtime constraint declared");
        }

        let mut command = Command::new(&def.command);
        command
            .args(&def.args)
            .envs(&def.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if def.repository.is_some() {
            command.current_dir(self.server_dir(name));
        }

        info!(server = name, command = %def.command, args = ?def.args, "starting MCP server");
        let mut child = command.spawn().map_err(|err| BridgeError::Spawn {
            name: name.to_string(),
            reason: format!("failed to spawn '{}': {err}", def.command),
            stderr_tail: String::new(),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::spawn(name, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::spawn(name, "child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::spawn(name, "child stderr unavailable"))?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let handle = Arc::new(ProcessHandle {
            name: name.to_string(),
            generation,
            pid,
            started_at: Instant::now(),
            client: FramedClient::new(name, stdout, stdin),
            stderr_tail: spawn_stderr_reader(name.to_string(), stderr),
            consecutive_timeouts: AtomicU32::new(0),
            last_healthy: StdMutex::new(None),
            exit_flag: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(Notify::new()),
        });

        // The watcher owns the Child from here: it reaps the exit status and
        // hands it to the restart policy.
        {
            let supervisor = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                handle.exit_flag.store(true, Ordering::SeqCst);
                handle.exited.notify_waiters();
                match status {
                    Ok(status) => {
                        supervisor.report_exit(&handle.name, handle.generation, Some(status));
                    }
                    Err(err) => {
                        warn!(server = %handle.name, error = %err, "failed to reap child process");
                        supervisor.report_exit(&handle.name, handle.generation, None);
                    }
                }
            });
        }

        self.await_ready(name, &handle).await?;
        info!(server = name, pid = ?pid, generation, "MCP server running");
        Ok(handle)
    }

    /// Readiness: a successful `initialize` handshake, or the grace period
    /// elapsing on a server that never answers it. A process that dies or
    /// breaks its pipe before either counts as a spawn failure.
    async fn await_ready(&self, name: &str, handle: &Arc<ProcessHandle>) -> Result<()> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": format!("initialize_{}", handle.generation),
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-relay",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }
        });

        let timeout = self.inner.config.ready_timeout();
        match handle.client.send(&request, timeout).await {
            Ok(_) => {
                handle.mark_healthy();
                let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
                let _ = handle.client.notify(&initialized, timeout).await;
                debug!(server = name, "initialize handshake acknowledged");
                Ok(())
            }
            Err(BridgeError::Timeout(_)) if !handle.is_closed() => {
                debug!(server = name, "no initialize response within grace period; assuming ready");
                Ok(())
            }
            Err(err) => Err(BridgeError::Spawn {
                name: name.to_string(),
                reason: format!("process failed before becoming ready: {err}"),
                stderr_tail: handle.stderr_tail(),
            }),
        }
    }

    /// Clone + build a server's source once per name, before its first spawn.
    async fn run_build_step(&self, name: &str, def: &ServerDefinition) -> Result<()> {
        if def.repository.is_none() && def.build_command.is_none() {
            return Ok(());
        }
        let mut built = self.inner.built.lock().await;
        if built.contains(name) {
            return Ok(());
        }

        let dir = self.server_dir(name);
        if let Some(repository) = &def.repository {
            if !dir.exists() {
                tokio::fs::create_dir_all(&self.inner.workdir)
                    .await
                    .map_err(|err| {
                        BridgeError::spawn(name, format!("cannot create workdir: {err}"))
                    })?;
                info!(server = name, repository = %repository, "cloning server source");
                let output = Command::new("git")
                    .arg("clone")
                    .arg(repository)
                    .arg(&dir)
                    .output()
                    .await
                    .map_err(|err| BridgeError::spawn(name, format!("git unavailable: {err}")))?;
                if !output.status.success() {
                    return Err(BridgeError::Spawn {
                        name: name.to_string(),
                        reason: format!("git clone failed ({})", output.status),
                        stderr_tail: tail_of(&output.stderr),
                    });
                }
            }
        }

        if let Some(build_command) = &def.build_command {
            let cwd = if def.repository.is_some() {
                dir
            } else {
                self.inner.workdir.clone()
            };
            tokio::fs::create_dir_all(&cwd)
                .await
                .map_err(|err| BridgeError::spawn(name, format!("cannot create workdir: {err}")))?;
            info!(server = name, command = %build_command, "running build step");
            let output = Command::new("sh")
                .arg("-c")
                .arg(build_command)
                .current_dir(&cwd)
                .output()
                .await
                .map_err(|err| BridgeError::spawn(name, format!("build failed to start: {err}")))?;
            if !output.status.success() {
                return Err(BridgeError::Spawn {
                    name: name.to_string(),
                    reason: format!("build command failed ({})", output.status),
                    stderr_tail: tail_of(&output.stderr),
                });
            }
        }

        built.insert(name.to_string());
        Ok(())
    }

    fn server_dir(&self, name: &str) -> PathBuf {
        self.inner.workdir.join(name)
    }
}

/// SIGTERM, wait out `grace`, then SIGKILL. No-op if already exited.
async fn terminate_process(handle: &ProcessHandle, grace: Duration) {
    if handle.has_exited() {
        return;
    }
    let Some(pid) = handle.pid else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);

    if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
        debug!(server = %handle.name, error = %err, "SIGTERM failed (already gone?)");
    }
    match tokio::time::timeout(grace, handle.wait_exited()).await {
        Ok(()) => {
            info!(server = %handle.name, "process exited after SIGTERM");
        }
        Err(_) => {
            warn!(server = %handle.name, grace_secs = grace.as_secs(), "shutdown grace expired; killing");
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = tokio::time::timeout(Duration::from_secs(2), handle.wait_exited()).await;
        }
    }
}

/// Tee a child's stderr into the log and keep the last ~4KB for error
/// reporting.
fn spawn_stderr_reader(name: String, mut stderr: ChildStderr) -> Arc<StdMutex<String>> {
    let tail: Arc<StdMutex<String>> = Arc::new(StdMutex::new(String::new()));
    let buffer = tail.clone();
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 1024];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    for line in text.lines() {
                        debug!(server = %name, line, "server stderr");
                    }
                    let mut guard = lock_ignore_poison(&buffer);
                    guard.push_str(&text);
                    if guard.len() > STDERR_TAIL_BYTES {
                        let mut trim_at = guard.len() - STDERR_TAIL_BYTES;
                        while !guard.is_char_boundary(trim_at) {
                            trim_at += 1;
                        }
                        let trimmed = guard[trim_at..].to_string();
                        *guard = trimmed;
                    }
                }
                Err(err) => {
                    warn!(server = %name, error = %err, "stderr read error");
                    break;
                }
            }
        }
    });
    tail
}

fn tail_of(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= STDERR_TAIL_BYTES {
        return text.into_owned();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn lock_ignore_poison<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
