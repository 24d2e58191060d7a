//! Units of work and the containers that track their lifecycle.

use crate::error::{ContainerError, RegistryError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// A user-defined unit of work.
///
/// `setup` is launched as an independent task and is expected to run until
/// `shutdown` asks it to stop. `shutdown` is awaited by the caller and must
/// return within the process shutdown budget.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    /// Unique within its service. Must not contain commas.
    fn name(&self) -> &str;

    async fn setup(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Unknown => "Unknown",
            SandboxState::Starting => "Starting",
            SandboxState::Running => "Running",
            SandboxState::Stopping => "Stopping",
            SandboxState::Stopped => "Stopped",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, SandboxState::Starting | SandboxState::Running)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub state: SandboxState,
    pub started_at: Option<DateTime<Local>>,
    pub stopped_at: Option<DateTime<Local>>,
}

struct Status {
    current: ContainerStatus,
    /// Bumped on every start; a setup task only reports for its own run.
    run: u64,
}

pub(crate) fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() || name.contains(',') {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Runtime wrapper around one sandbox.
///
/// State reads never wait; transitions (start, stop, teardown) are
/// serialized per container so concurrent control calls cannot double-start
/// or double-stop it.
pub struct SandboxContainer {
    sandbox: Arc<dyn Sandbox>,
    status: Mutex<Status>,
    transition: tokio::sync::Mutex<()>,
}

impl SandboxContainer {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Result<Self, RegistryError> {
        validate_name(sandbox.name())?;
        Ok(Self {
            sandbox,
            status: Mutex::new(Status {
                current: ContainerStatus {
                    state: SandboxState::Unknown,
                    started_at: None,
                    stopped_at: None,
                },
                run: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        self.sandbox.name()
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn status(&self) -> ContainerStatus {
        self.lock().current
    }

    pub fn state(&self) -> SandboxState {
        self.lock().current.state
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `Unknown|Stopped -> Running`, launching `setup` as its own task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ContainerError> {
        let _transition = self.transition.lock().await;
        let run = {
            let mut status = self.lock();
            if status.current.state.is_active() {
                return Err(ContainerError::AlreadyRunning(self.name().to_string()));
            }
            status.run += 1;
            status.current.state = SandboxState::Running;
            status.current.started_at = Some(Local::now());
            status.run
        };

        let container = Arc::clone(self);
        tokio::spawn(async move {
            let result = container.sandbox.setup().await;
            container.setup_returned(run, result);
        });
        debug!(sandbox = %self.name(), "sandbox started");
        Ok(())
    }

    fn setup_returned(&self, run: u64, result: anyhow::Result<()>) {
        let mut status = self.lock();
        let current_run = status.run == run && status.current.state == SandboxState::Running;
        match result {
            Err(e) if current_run => {
                status.current.state = SandboxState::Stopped;
                status.current.stopped_at = Some(Local::now());
                warn!(sandbox = %self.name(), error = %format!("{e:#}"), "sandbox setup returned");
            }
            Err(e) => {
                debug!(sandbox = %self.name(), error = %format!("{e:#}"), "setup of a stopped run returned");
            }
            Ok(()) => debug!(sandbox = %self.name(), "sandbox setup returned"),
        }
    }

    /// `Running -> Stopping -> Stopped`. Returns `Ok(false)` without calling
    /// `shutdown` when the container is not running. The container ends up
    /// `Stopped` even when `shutdown` fails.
    pub async fn stop(&self) -> Result<bool, ContainerError> {
        let _transition = self.transition.lock().await;
        {
            let mut status = self.lock();
            if !status.current.state.is_active() {
                return Ok(false);
            }
            status.current.state = SandboxState::Stopping;
        }

        let result = self.sandbox.shutdown().await;
        {
            let mut status = self.lock();
            status.current.state = SandboxState::Stopped;
            status.current.stopped_at = Some(Local::now());
        }

        match result {
            Ok(()) => {
                info!(sandbox = %self.name(), "sandbox stopped");
                Ok(true)
            }
            Err(e) => {
                error!(sandbox = %self.name(), error = %format!("{e:#}"), "sandbox shutdown failed");
                Err(ContainerError::Shutdown {
                    name: self.name().to_string(),
                    source: e.into(),
                })
            }
        }
    }

    /// Process-exit path: always calls `shutdown`, only logs failures.
    pub async fn teardown(&self) {
        let _transition = self.transition.lock().await;
        let was_active = {
            let mut status = self.lock();
            let active = status.current.state.is_active();
            if active {
                status.current.state = SandboxState::Stopping;
            }
            active
        };

        match self.sandbox.shutdown().await {
            Ok(()) => info!(sandbox = %self.name(), "sandbox finished"),
            Err(e) => error!(sandbox = %self.name(), error = %format!("{e:#}"), "sandbox shutdown failed"),
        }

        if was_active {
            let mut status = self.lock();
            status.current.state = SandboxState::Stopped;
            status.current.stopped_at = Some(Local::now());
        }
    }
}

impl fmt::Debug for SandboxContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxContainer")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Probe {
        name: String,
        fail_setup: bool,
        fail_shutdown: bool,
        release: Notify,
        shutdowns: AtomicUsize,
    }

    impl Probe {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_setup: false,
                fail_shutdown: false,
                release: Notify::new(),
                shutdowns: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Sandbox for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&self) -> anyhow::Result<()> {
            if self.fail_setup {
                anyhow::bail!("listen failed");
            }
            self.release.notified().await;
            anyhow::bail!("server closed")
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.release.notify_one();
            if self.fail_shutdown {
                anyhow::bail!("refused");
            }
            Ok(())
        }
    }

    async fn wait_for_state(container: &SandboxContainer, state: SandboxState) {
        for _ in 0..100 {
            if container.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("container never reached {state}");
    }

    #[test]
    fn names_with_commas_are_rejected() {
        let probe = Arc::new(Probe::new("a,b"));
        assert!(matches!(
            SandboxContainer::new(probe),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            SandboxContainer::new(Arc::new(Probe::new("  "))),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_state_machine() {
        let probe = Arc::new(Probe::new("web"));
        let container = Arc::new(SandboxContainer::new(probe.clone()).unwrap());

        let status = container.status();
        assert_eq!(status.state, SandboxState::Unknown);
        assert!(status.started_at.is_none());

        container.start().await.unwrap();
        let status = container.status();
        assert_eq!(status.state, SandboxState::Running);
        assert!(status.started_at.is_some());

        assert!(matches!(
            container.start().await,
            Err(ContainerError::AlreadyRunning(_))
        ));
        assert_eq!(container.status().started_at, status.started_at);

        assert!(container.stop().await.unwrap());
        let status = container.status();
        assert_eq!(status.state, SandboxState::Stopped);
        assert!(status.stopped_at.is_some());
        assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_shutdown_still_stops() {
        let mut probe = Probe::new("db");
        probe.fail_shutdown = true;
        let container = Arc::new(SandboxContainer::new(Arc::new(probe)).unwrap());

        container.start().await.unwrap();
        assert!(matches!(
            container.stop().await,
            Err(ContainerError::Shutdown { .. })
        ));
        assert_eq!(container.state(), SandboxState::Stopped);
        assert!(container.status().stopped_at.is_some());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let probe = Arc::new(Probe::new("cache"));
        let container = SandboxContainer::new(probe.clone()).unwrap();
        assert!(!container.stop().await.unwrap());
        assert_eq!(container.state(), SandboxState::Unknown);
        assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn setup_error_marks_container_stopped() {
        let mut probe = Probe::new("broken");
        probe.fail_setup = true;
        let container = Arc::new(SandboxContainer::new(Arc::new(probe)).unwrap());

        container.start().await.unwrap();
        wait_for_state(&container, SandboxState::Stopped).await;
        assert!(container.status().stopped_at.is_some());
    }

    #[tokio::test]
    async fn restarted_container_ignores_previous_setup_result() {
        let probe = Arc::new(Probe::new("worker"));
        let container = Arc::new(SandboxContainer::new(probe.clone()).unwrap());

        container.start().await.unwrap();
        container.stop().await.unwrap();
        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(container.state(), SandboxState::Running);
    }

    #[tokio::test]
    async fn teardown_calls_shutdown_even_when_never_started() {
        let probe = Arc::new(Probe::new("idle"));
        let container = SandboxContainer::new(probe.clone()).unwrap();
        container.teardown().await;
        assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(container.state(), SandboxState::Unknown);
    }
}
