//! OS-process supervision keyed by service name.
//!
//! The orchestrator only talks to [`ProcessManager`]; [`LocalProcessManager`]
//! is the in-tree implementation used by the binary. It follows supervisor
//! semantics: a process is `Starting` until it survived `start_secs`, early
//! exits back off and retry, and a graceful reload brings up the replacement
//! before the current process is asked to stop.

use crate::error::ProcessError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// First descriptor number handed to children for inherited files.
pub const FIRST_INHERITED_FD: RawFd = 3;

pub const DEFAULT_START_SECS: Duration = Duration::from_secs(1);
pub const DEFAULT_START_RETRIES: u32 = 3;

/// Supervisor-style process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "Stopped",
            ProcessState::Starting => "Starting",
            ProcessState::Running => "Running",
            ProcessState::Backoff => "Backoff",
            ProcessState::Stopping => "Stopping",
            ProcessState::Exited => "Exited",
            ProcessState::Fatal => "Fatal",
            ProcessState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a child's stdout (and optionally stderr) goes.
#[derive(Debug, Clone)]
pub enum StdoutTarget {
    Inherit,
    Null,
    File(PathBuf),
}

/// Everything needed to (re)spawn one supervised process.
#[derive(Debug, Clone)]
pub struct ProcOptions {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the parent's environment.
    pub env: Vec<(String, String)>,
    pub stdout: StdoutTarget,
    pub redirect_stderr: bool,
    pub auto_restart: bool,
    /// Delivered in order, `stop_wait` apart, before falling back to SIGKILL.
    pub stop_signals: Vec<Signal>,
    pub stop_wait: Duration,
    pub start_secs: Duration,
    pub start_retries: u32,
    /// Placed at fd 3, 4, ... in the child, in this order.
    pub extra_files: Vec<Arc<OwnedFd>>,
}

impl ProcOptions {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdout: StdoutTarget::Inherit,
            redirect_stderr: true,
            auto_restart: false,
            stop_signals: vec![Signal::SIGTERM],
            stop_wait: Duration::from_secs(10),
            start_secs: DEFAULT_START_SECS,
            start_retries: DEFAULT_START_RETRIES,
            extra_files: Vec::new(),
        }
    }
}

/// Snapshot of one supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub description: String,
    pub pid: Option<u32>,
}

impl ProcessInfo {
    pub fn state_name(&self) -> &'static str {
        self.state.as_str()
    }
}

/// Spawning, stopping and reloading OS processes by name.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Registers a process definition without starting it.
    async fn new_process(&self, options: ProcOptions) -> Result<(), ProcessError>;

    /// With `wait`, resolves once the process left its startup phase and
    /// reports whether it reached `Running`.
    async fn start_process(&self, name: &str, wait: bool) -> Result<bool, ProcessError>;

    async fn stop_process(&self, name: &str, wait: bool) -> Result<bool, ProcessError>;

    /// Starts a replacement first and stops the current process only once
    /// the replacement is up.
    async fn graceful_reload(&self, name: &str, wait: bool) -> Result<bool, ProcessError>;

    async fn process_info(&self, name: &str) -> Result<ProcessInfo, ProcessError>;
}

/// `pid P, uptime [D days, ]H:MM:SS`
pub fn uptime_description(pid: u32, uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if days > 0 {
        format!(
            "pid {}, uptime {} days, {}:{:02}:{:02}",
            pid,
            days,
            hours % 24,
            minutes % 60,
            seconds % 60
        )
    } else {
        format!(
            "pid {}, uptime {}:{:02}:{:02}",
            pid,
            hours % 24,
            minutes % 60,
            seconds % 60
        )
    }
}

#[derive(Debug, Clone)]
struct RunningChild {
    pid: u32,
    exited: watch::Receiver<bool>,
}

struct Managed {
    options: Arc<ProcOptions>,
    state: watch::Sender<ProcessState>,
    current: Option<RunningChild>,
    /// Replacement spawned by a graceful reload that has not taken over yet.
    pending: Option<RunningChild>,
    stop_requested: bool,
    retries: u32,
    started: Option<Instant>,
    stopped_at: Option<DateTime<Local>>,
}

impl Managed {
    fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }
}

/// [`ProcessManager`] backed by `tokio::process` children of this process.
#[derive(Clone, Default)]
pub struct LocalProcessManager {
    procs: Arc<Mutex<HashMap<String, Managed>>>,
}

impl LocalProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Managed>> {
        self.procs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_child(&self, options: &ProcOptions) -> Result<RunningChild, ProcessError> {
        let spawn_err = |source| ProcessError::Spawn {
            name: options.name.clone(),
            source,
        };

        let mut cmd = Command::new(&options.command);
        cmd.args(&options.args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        match &options.stdout {
            StdoutTarget::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdoutTarget::Null => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            StdoutTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(spawn_err)?;
                if options.redirect_stderr {
                    cmd.stderr(file.try_clone().map_err(spawn_err)?);
                } else {
                    cmd.stderr(Stdio::inherit());
                }
                cmd.stdout(file);
            }
        }

        // High-numbered CLOEXEC copies, so dup2 onto 3.. in the child never
        // clobbers a source descriptor.
        let inherited = duplicate_above(&options.extra_files).map_err(spawn_err)?;
        if !inherited.is_empty() {
            let raw: Vec<RawFd> = inherited.iter().map(|fd| fd.as_raw_fd()).collect();
            // SAFETY: only async-signal-safe calls between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    for (i, fd) in raw.iter().enumerate() {
                        if libc::dup2(*fd, FIRST_INHERITED_FD + i as RawFd) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        drop(inherited);
        let pid = child.id().unwrap_or_default();

        let (tx, exited) = watch::channel(false);
        let manager = self.clone();
        let name = options.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = tx.send(true);
            manager.on_exit(&name, pid, status);
        });

        debug!(process = %options.name, pid, "spawned child");
        Ok(RunningChild { pid, exited })
    }

    /// Spawns the current generation and schedules its startup confirmation.
    fn launch(&self, entry: &mut Managed) -> Result<RunningChild, ProcessError> {
        let child = match self.spawn_child(&entry.options) {
            Ok(child) => child,
            Err(e) => {
                entry.stopped_at = Some(Local::now());
                entry.set_state(ProcessState::Fatal);
                return Err(e);
            }
        };
        entry.current = Some(child.clone());
        entry.stop_requested = false;
        entry.started = Some(Instant::now());
        entry.set_state(ProcessState::Starting);

        let manager = self.clone();
        let name = entry.options.name.clone();
        let start_secs = entry.options.start_secs;
        let pid = child.pid;
        tokio::spawn(async move {
            tokio::time::sleep(start_secs).await;
            let mut procs = manager.lock();
            if let Some(entry) = procs.get_mut(&name) {
                let same = entry.current.as_ref().map(|c| c.pid) == Some(pid);
                if same && entry.state() == ProcessState::Starting {
                    entry.retries = 0;
                    entry.set_state(ProcessState::Running);
                    info!(process = %name, pid, "entered RUNNING state");
                }
            }
        });
        Ok(child)
    }

    fn on_exit(&self, name: &str, pid: u32, status: io::Result<ExitStatus>) {
        let mut procs = self.lock();
        let Some(entry) = procs.get_mut(name) else {
            return;
        };
        if entry.pending.as_ref().map(|c| c.pid) == Some(pid) {
            entry.pending = None;
            warn!(process = %name, pid, ?status, "reload replacement exited");
            return;
        }
        if entry.current.as_ref().map(|c| c.pid) != Some(pid) {
            debug!(process = %name, pid, ?status, "previous generation exited");
            return;
        }

        entry.current = None;
        entry.stopped_at = Some(Local::now());
        if entry.stop_requested {
            entry.set_state(ProcessState::Stopped);
            info!(process = %name, pid, ?status, "stopped");
            return;
        }

        if entry.state() == ProcessState::Starting {
            if entry.retries >= entry.options.start_retries {
                entry.set_state(ProcessState::Fatal);
                warn!(process = %name, pid, ?status, "exited too quickly, giving up");
                return;
            }
            entry.retries += 1;
            entry.set_state(ProcessState::Backoff);
            warn!(process = %name, pid, ?status, retry = entry.retries, "exited too quickly, backing off");
            self.schedule_restart(name, Duration::from_secs(u64::from(entry.retries)));
        } else {
            entry.set_state(ProcessState::Exited);
            warn!(process = %name, pid, ?status, "exited unexpectedly");
            if entry.options.auto_restart {
                self.schedule_restart(name, Duration::ZERO);
            }
        }
    }

    fn schedule_restart(&self, name: &str, delay: Duration) {
        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut procs = manager.lock();
            let Some(entry) = procs.get_mut(&name) else {
                return;
            };
            let restartable = matches!(entry.state(), ProcessState::Backoff | ProcessState::Exited);
            if entry.current.is_none() && !entry.stop_requested && restartable {
                if let Err(e) = manager.launch(entry) {
                    warn!(process = %name, error = %e, "restart failed");
                }
            }
        });
    }

    async fn finish_reload(
        self,
        old: RunningChild,
        replacement: RunningChild,
        options: Arc<ProcOptions>,
    ) -> Result<bool, ProcessError> {
        let name = options.name.clone();
        let mut exited = replacement.exited.clone();
        if tokio::time::timeout(options.start_secs, exited.wait_for(|e| *e))
            .await
            .is_ok()
        {
            warn!(process = %name, "replacement died during startup, keeping the current process");
            return Ok(false);
        }

        {
            let mut procs = self.lock();
            let entry = procs
                .get_mut(&name)
                .ok_or_else(|| ProcessError::NotFound(name.clone()))?;
            // Cleared by a stop that arrived during the startup window.
            if entry.stop_requested || entry.pending.as_ref().map(|c| c.pid) != Some(replacement.pid) {
                return Ok(false);
            }
            entry.pending = None;
            entry.current = Some(replacement.clone());
            entry.started = Some(Instant::now());
            entry.retries = 0;
            entry.set_state(ProcessState::Running);
        }
        info!(
            process = %name,
            old_pid = old.pid,
            new_pid = replacement.pid,
            "replacement is running, stopping the previous process"
        );
        terminate(name, old, options.stop_signals.clone(), options.stop_wait).await?;
        Ok(true)
    }

    async fn stop_children(
        self,
        name: String,
        children: Vec<RunningChild>,
        options: Arc<ProcOptions>,
    ) -> Result<(), ProcessError> {
        for child in children {
            terminate(name.clone(), child, options.stop_signals.clone(), options.stop_wait).await?;
        }
        // Without a current generation no exit report will settle the state.
        let mut procs = self.lock();
        if let Some(entry) = procs.get_mut(&name) {
            if entry.current.is_none() && entry.state() == ProcessState::Stopping {
                entry.stopped_at = Some(Local::now());
                entry.set_state(ProcessState::Stopped);
            }
        }
        Ok(())
    }
}

/// Signals `child` through `signals` then SIGKILL until it is gone.
async fn terminate(
    name: String,
    child: RunningChild,
    signals: Vec<Signal>,
    stop_wait: Duration,
) -> Result<(), ProcessError> {
    let mut exited = child.exited;
    let pid = Pid::from_raw(child.pid as i32);
    for signal in signals.into_iter().chain(std::iter::once(Signal::SIGKILL)) {
        if *exited.borrow() {
            return Ok(());
        }
        match kill(pid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(source) => return Err(ProcessError::Signal { name, source }),
        }
        if tokio::time::timeout(stop_wait, exited.wait_for(|e| *e))
            .await
            .is_ok()
        {
            return Ok(());
        }
        debug!(process = %name, ?signal, "still alive after signal");
    }
    Ok(())
}

fn duplicate_above(files: &[Arc<OwnedFd>]) -> io::Result<Vec<OwnedFd>> {
    let floor = FIRST_INHERITED_FD + files.len() as RawFd;
    files
        .iter()
        .map(|fd| {
            let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))?;
            // SAFETY: `raw` was just returned by fcntl and is owned by nobody else.
            Ok(unsafe { OwnedFd::from_raw_fd(raw) })
        })
        .collect()
}

#[async_trait]
impl ProcessManager for LocalProcessManager {
    async fn new_process(&self, options: ProcOptions) -> Result<(), ProcessError> {
        let mut procs = self.lock();
        if procs.contains_key(&options.name) {
            return Err(ProcessError::AlreadyExists(options.name));
        }
        let (state, _) = watch::channel(ProcessState::Stopped);
        procs.insert(
            options.name.clone(),
            Managed {
                options: Arc::new(options),
                state,
                current: None,
                pending: None,
                stop_requested: false,
                retries: 0,
                started: None,
                stopped_at: None,
            },
        );
        Ok(())
    }

    async fn start_process(&self, name: &str, wait: bool) -> Result<bool, ProcessError> {
        let mut state = {
            let mut procs = self.lock();
            let entry = procs
                .get_mut(name)
                .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
            if entry.current.is_some() {
                return Err(ProcessError::AlreadyStarted(name.to_string()));
            }
            entry.retries = 0;
            self.launch(entry)?;
            entry.state.subscribe()
        };
        if !wait {
            return Ok(true);
        }
        let reached = state
            .wait_for(|s| !matches!(s, ProcessState::Starting | ProcessState::Backoff))
            .await
            .map(|s| *s)
            .unwrap_or(ProcessState::Unknown);
        Ok(reached == ProcessState::Running)
    }

    async fn stop_process(&self, name: &str, wait: bool) -> Result<bool, ProcessError> {
        let (children, options) = {
            let mut procs = self.lock();
            let entry = procs
                .get_mut(name)
                .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
            // A replacement still in its startup window goes down with the
            // current generation.
            let children: Vec<RunningChild> =
                entry.current.iter().cloned().chain(entry.pending.take()).collect();
            if children.is_empty() {
                if entry.state() == ProcessState::Backoff {
                    entry.stop_requested = true;
                    entry.set_state(ProcessState::Stopped);
                    return Ok(true);
                }
                return Err(ProcessError::NotRunning(name.to_string()));
            }
            entry.stop_requested = true;
            entry.set_state(ProcessState::Stopping);
            (children, entry.options.clone())
        };

        let task = self.clone().stop_children(name.to_string(), children, options);
        if wait {
            task.await?;
        } else {
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!(process = %name, error = %e, "stop failed");
                }
            });
        }
        Ok(true)
    }

    async fn graceful_reload(&self, name: &str, wait: bool) -> Result<bool, ProcessError> {
        let (old, replacement, options) = {
            let mut procs = self.lock();
            let entry = procs
                .get_mut(name)
                .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
            let Some(old) = entry.current.clone() else {
                return Err(ProcessError::NotRunning(name.to_string()));
            };
            if entry.pending.is_some() {
                return Ok(false);
            }
            let replacement = self.spawn_child(&entry.options)?;
            entry.pending = Some(replacement.clone());
            (old, replacement, entry.options.clone())
        };
        info!(process = %name, pid = replacement.pid, "spawned replacement for graceful reload");

        let task = self.clone().finish_reload(old, replacement, options);
        if wait {
            return task.await;
        }
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(process = %name, error = %e, "graceful reload failed");
            }
        });
        Ok(true)
    }

    async fn process_info(&self, name: &str) -> Result<ProcessInfo, ProcessError> {
        let procs = self.lock();
        let entry = procs
            .get(name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
        let state = entry.state();
        let pid = entry.current.as_ref().map(|c| c.pid);
        let description = match state {
            ProcessState::Running => uptime_description(
                pid.unwrap_or_default(),
                entry.started.map(|s| s.elapsed()).unwrap_or_default(),
            ),
            ProcessState::Backoff | ProcessState::Fatal => {
                "Exited too quickly (process log may have details)".to_string()
            }
            ProcessState::Stopped | ProcessState::Stopping | ProcessState::Exited => entry
                .stopped_at
                .map(|t| t.format("%b %d %I:%M %p").to_string())
                .unwrap_or_else(|| "Not started".to_string()),
            ProcessState::Starting | ProcessState::Unknown => String::new(),
        };
        Ok(ProcessInfo {
            name: name.to_string(),
            state,
            description,
            pid,
        })
    }
}
