//! Shutdown and reload coordination.
//!
//! OS signals and programmatic requests are turned into [`Event`]s on one
//! channel. A single task runs [`GracefulController::wait`], which drives the
//! [`GracefulHooks`] in order: `first_sweep`, then `before_exiting` bounded by
//! the shutdown budget. Reload events call `reload` and keep the loop going.

use crate::error::GracefulError;
use crate::process::FIRST_INHERITED_FD;
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::collections::HashMap;
use std::env;
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Comma-joined listen addresses, in the order their descriptors start at fd 3.
pub const INHERIT_ENV: &str = "SANDBOXD_INHERIT_ADDRS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Terminate,
    Reload,
}

#[async_trait]
pub trait GracefulHooks: Send + Sync {
    /// Returns `Ok(false)` when a shutdown is already in progress.
    /// [`GracefulError::Vetoed`] cancels the shutdown.
    async fn first_sweep(&self) -> Result<bool, GracefulError>;

    async fn before_exiting(&self);

    async fn reload(&self);
}

pub struct GracefulController {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    timeout: Duration,
}

impl GracefulController {
    pub fn new(timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Terminate);
    }

    pub fn reload(&self) {
        let _ = self.tx.send(Event::Reload);
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    /// SIGTERM, SIGINT and SIGQUIT terminate; SIGUSR2 and SIGHUP reload.
    pub fn listen_signals(&self) -> Result<JoinHandle<()>, GracefulError> {
        let mut term = signal(SignalKind::terminate()).map_err(GracefulError::Signal)?;
        let mut int = signal(SignalKind::interrupt()).map_err(GracefulError::Signal)?;
        let mut quit = signal(SignalKind::quit()).map_err(GracefulError::Signal)?;
        let mut usr2 = signal(SignalKind::user_defined2()).map_err(GracefulError::Signal)?;
        let mut hup = signal(SignalKind::hangup()).map_err(GracefulError::Signal)?;
        let tx = self.tx.clone();

        Ok(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(_) = term.recv() => Event::Terminate,
                    Some(_) = int.recv() => Event::Terminate,
                    Some(_) = quit.recv() => Event::Terminate,
                    Some(_) = usr2.recv() => Event::Reload,
                    Some(_) = hup.recv() => Event::Reload,
                    else => break,
                };
                debug!(?event, "signal received");
                if tx.send(event).is_err() {
                    break;
                }
            }
        }))
    }

    /// Consumes events until a shutdown completes. Only one caller may wait.
    pub async fn wait(&self, hooks: &dyn GracefulHooks) -> Result<(), GracefulError> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(GracefulError::Closed)?;

        while let Some(event) = rx.recv().await {
            match event {
                Event::Reload => {
                    info!("reload requested");
                    hooks.reload().await;
                }
                Event::Terminate => match hooks.first_sweep().await {
                    Ok(true) => {
                        info!(timeout = ?self.timeout, "shutting down");
                        if tokio::time::timeout(self.timeout, hooks.before_exiting())
                            .await
                            .is_err()
                        {
                            warn!(timeout = ?self.timeout, "shutdown budget exhausted");
                        }
                        return Ok(());
                    }
                    Ok(false) => debug!("shutdown already in progress"),
                    Err(e) => warn!(error = %e, "shutdown cancelled"),
                },
            }
        }
        Err(GracefulError::Closed)
    }
}

impl Default for GracefulController {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

/// Listening sockets shared across process generations.
///
/// The master binds every configured address once and hands the sockets to
/// each worker at fd 3.. in address order; the worker adopts them at
/// startup. A reloaded worker inherits the very same sockets, so the old and
/// new generation accept on one queue while they overlap.
#[derive(Debug, Default)]
pub struct Inheritance {
    addrs: Vec<String>,
    listeners: Mutex<HashMap<String, TcpListener>>,
}

impl Inheritance {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Adopts the descriptors announced in [`INHERIT_ENV`], if any.
    pub fn from_env() -> io::Result<Self> {
        match env::var(INHERIT_ENV) {
            Ok(list) if !list.is_empty() => Self::adopt(&list),
            _ => Ok(Self::default()),
        }
    }

    fn adopt(list: &str) -> io::Result<Self> {
        let addrs: Vec<String> = list.split(',').map(str::to_string).collect();
        let mut listeners = HashMap::new();
        for (i, addr) in addrs.iter().enumerate() {
            let fd = FIRST_INHERITED_FD + i as RawFd;
            // Refuse to wrap a descriptor that is not open.
            fcntl(fd, FcntlArg::F_GETFD)?;
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            // SAFETY: the parent placed this listener at `fd` for us and
            // nothing else in this process owns it.
            let listener = unsafe { TcpListener::from_raw_fd(fd) };
            debug!(addr = %addr, fd, "adopted inherited listener");
            listeners.insert(addr.clone(), listener);
        }
        Ok(Self {
            addrs,
            listeners: Mutex::new(listeners),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TcpListener>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Adds addresses that are not configured yet.
    pub fn extend(&mut self, addrs: impl IntoIterator<Item = String>) {
        for addr in addrs {
            if !self.addrs.contains(&addr) {
                self.addrs.push(addr);
            }
        }
    }

    /// Binds every configured address that has no socket yet.
    pub fn bind_all(&self) -> io::Result<()> {
        let mut listeners = self.lock();
        for addr in &self.addrs {
            if !listeners.contains_key(addr) {
                let listener = TcpListener::bind(addr.as_str())?;
                info!(addr = %addr, "listening for inheritance");
                listeners.insert(addr.clone(), listener);
            }
        }
        Ok(())
    }

    /// Descriptors to pass to a worker, in address order.
    pub fn extra_files(&self) -> io::Result<Vec<Arc<OwnedFd>>> {
        let listeners = self.lock();
        self.addrs
            .iter()
            .map(|addr| {
                let listener = listeners.get(addr).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{addr} is not bound"))
                })?;
                Ok(Arc::new(OwnedFd::from(listener.try_clone()?)))
            })
            .collect()
    }

    /// Environment announcing the descriptors to a worker.
    pub fn env(&self) -> Vec<(String, String)> {
        if self.addrs.is_empty() {
            return Vec::new();
        }
        vec![(INHERIT_ENV.to_string(), self.addrs.join(","))]
    }

    /// The inherited socket for `addr`, or a freshly bound one.
    pub fn listener(&self, addr: &str) -> io::Result<TcpListener> {
        if let Some(listener) = self.lock().get(addr) {
            debug!(addr, fd = listener.as_raw_fd(), "using inherited listener");
            return listener.try_clone();
        }
        TcpListener::bind(addr)
    }
}
