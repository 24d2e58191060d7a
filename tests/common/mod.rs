#![allow(dead_code)]

use async_trait::async_trait;
use sandboxd::daemon::Daemonize;
use sandboxd::error::ProcessError;
use sandboxd::process::{ProcessInfo, ProcessState};
use sandboxd::{Config, Options, Orchestrator, OrchestratorBuilder, ProcOptions, ProcessManager, Sandbox};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Sandbox that runs until shut down and counts lifecycle calls.
pub struct Counting {
    name: String,
    pub setups: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub fail_shutdown: AtomicBool,
    pub hang_shutdown: AtomicBool,
    release: Notify,
}

impl Counting {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            setups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_shutdown: AtomicBool::new(false),
            hang_shutdown: AtomicBool::new(false),
            release: Notify::new(),
        })
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for Counting {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&self) -> anyhow::Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.hang_shutdown.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.release.notify_one();
        if self.fail_shutdown.load(Ordering::SeqCst) {
            anyhow::bail!("shutdown refused");
        }
        Ok(())
    }
}

/// Process manager that records calls instead of spawning anything.
#[derive(Default)]
pub struct RecordingManager {
    pub calls: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ProcOptions>>,
    /// Returned as the `ok` flag of start/stop/reload.
    pub not_ok: AtomicBool,
    pub broken_info: AtomicBool,
}

impl RecordingManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<ProcOptions> {
        self.created.lock().unwrap().clone()
    }

    fn record(&self, call: &str, name: &str) -> Result<(), ProcessError> {
        self.calls.lock().unwrap().push(format!("{call}:{name}"));
        if self.created.lock().unwrap().iter().any(|o| o.name == name) {
            Ok(())
        } else {
            Err(ProcessError::NotFound(name.to_string()))
        }
    }

    fn ok(&self) -> bool {
        !self.not_ok.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessManager for RecordingManager {
    async fn new_process(&self, options: ProcOptions) -> Result<(), ProcessError> {
        self.calls.lock().unwrap().push(format!("new:{}", options.name));
        self.created.lock().unwrap().push(options);
        Ok(())
    }

    async fn start_process(&self, name: &str, _wait: bool) -> Result<bool, ProcessError> {
        self.record("start", name).map(|_| self.ok())
    }

    async fn stop_process(&self, name: &str, _wait: bool) -> Result<bool, ProcessError> {
        self.record("stop", name).map(|_| self.ok())
    }

    async fn graceful_reload(&self, name: &str, _wait: bool) -> Result<bool, ProcessError> {
        self.record("reload", name).map(|_| self.ok())
    }

    async fn process_info(&self, name: &str) -> Result<ProcessInfo, ProcessError> {
        if self.broken_info.load(Ordering::SeqCst) {
            return Err(ProcessError::Spawn {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "supervisor unreachable"),
            });
        }
        self.record("info", name)?;
        Ok(ProcessInfo {
            name: name.to_string(),
            state: ProcessState::Running,
            description: "pid 4242, uptime 0:00:05".to_string(),
            pid: Some(4242),
        })
    }
}

pub struct Foreground;

impl Daemonize for Foreground {
    fn daemonize(&self) -> io::Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
pub struct Detaching {
    pub calls: AtomicUsize,
}

impl Daemonize for Detaching {
    fn daemonize(&self) -> io::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

/// A builder whose pid file and control socket live in `dir`, with the
/// control socket off and an empty in-memory config.
pub fn builder(dir: &Path, names: &[&str]) -> OrchestratorBuilder {
    Orchestrator::builder("sandboxd-test")
        .options(Options {
            names: names.iter().map(|n| n.to_string()).collect(),
            ..Options::default()
        })
        .pid_file(dir.join("test.pid"))
        .control_socket(dir.join("test.sock"))
        .control(false)
        .daemonizer(Arc::new(Foreground))
        .config(Config::empty())
        .master(true)
}
