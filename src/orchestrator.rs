//! The top-level runtime handle.
//!
//! An [`Orchestrator`] owns the service registry and drives one process
//! invocation: configuration, optional daemonization, logging, sandbox
//! registration through the embedder's start callback, then either running
//! sandboxes in-process or spawning one worker process per service.

use crate::cli::{Options, ProcessModel};
use crate::config::Config;
use crate::control::ControlPlane;
use crate::ctl_server::{self, Endpoint};
use crate::daemon::{Daemonize, PidFile, ReExecDaemonizer};
use crate::error::{GracefulError, OrchestratorError, ProcessError, RegistryError, Result};
use crate::graceful::{GracefulController, GracefulHooks, Inheritance, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::logging::{self, LogControl, LogPolicy};
use crate::process::{LocalProcessManager, ProcOptions, ProcessManager, StdoutTarget};
use crate::sandbox::{validate_name, Sandbox, SandboxContainer};
use crate::service::{Service, DEFAULT_SERVICE};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// `false`, `0` or `no` marks a spawned worker; anything else, or no
/// value at all, is the master.
pub const MASTER_ENV: &str = "SANDBOXD_MULTI_MASTER";

pub fn master_from_env() -> bool {
    match env::var(MASTER_ENV) {
        Ok(value) => !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"),
        Err(_) => true,
    }
}

/// Sandbox names selected by `filter` among `names`, in `names` order.
/// An empty filter selects everything.
pub fn effective_names(filter: &[String], names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|n| filter.is_empty() || filter.iter().any(|f| f.eq_ignore_ascii_case(n)))
        .cloned()
        .collect()
}

/// Wait after each stop signal, so that every signal and the final SIGKILL
/// fit in the shutdown budget.
pub fn worker_stop_wait(budget: Duration, signals: usize) -> Duration {
    budget / (signals as u32 + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Running,
    /// A background copy took over; the caller should exit with status 0.
    Detached,
}

type BeforeStop = Box<dyn Fn(&Orchestrator) -> bool + Send + Sync>;

pub struct OrchestratorBuilder {
    name: String,
    options: Options,
    model: Option<ProcessModel>,
    master: Option<bool>,
    pid_file: Option<PathBuf>,
    control_socket: Option<PathBuf>,
    control: bool,
    before_stop: Option<BeforeStop>,
    manager: Option<Arc<dyn ProcessManager>>,
    daemonizer: Option<Arc<dyn Daemonize>>,
    inherit_addrs: Vec<String>,
    shutdown_timeout: Duration,
    worker_command: Option<PathBuf>,
    config: Option<Config>,
}

impl OrchestratorBuilder {
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Default model; `--model` overrides it.
    pub fn process_model(mut self, model: ProcessModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Overrides [`MASTER_ENV`].
    pub fn master(mut self, master: bool) -> Self {
        self.master = Some(master);
        self
    }

    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    pub fn control(mut self, enable: bool) -> Self {
        self.control = enable;
        self
    }

    /// Returning `false` cancels a shutdown.
    pub fn before_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Orchestrator) -> bool + Send + Sync + 'static,
    {
        self.before_stop = Some(Box::new(hook));
        self
    }

    pub fn process_manager(mut self, manager: Arc<dyn ProcessManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn daemonizer(mut self, daemonizer: Arc<dyn Daemonize>) -> Self {
        self.daemonizer = Some(daemonizer);
        self
    }

    /// Listen address shared with workers across reloads.
    pub fn inherit_addr(mut self, addr: impl Into<String>) -> Self {
        self.inherit_addrs.push(addr.into());
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Executable started for workers; the current one by default.
    pub fn worker_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.worker_command = Some(command.into());
        self
    }

    /// Uses `config` instead of resolving one from `--config`.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let master = self.master.unwrap_or_else(master_from_env);
        let model = if master {
            self.options.model.or(self.model).unwrap_or_default()
        } else {
            ProcessModel::Multi
        };
        let pid_file = self
            .pid_file
            .or_else(|| self.options.pid_file.clone())
            .map(PidFile::new)
            .unwrap_or_else(|| PidFile::for_name(&self.name));
        let control_socket = self
            .control_socket
            .unwrap_or_else(|| ctl_server::socket_path(&self.name));
        let control = self.control && !self.options.disable_control;

        Arc::new(Orchestrator {
            name: self.name,
            options: self.options,
            model,
            master,
            pid_file,
            control_socket,
            control,
            before_stop: self.before_stop,
            manager: self
                .manager
                .unwrap_or_else(|| Arc::new(LocalProcessManager::new())),
            daemonizer: self.daemonizer.unwrap_or_else(|| Arc::new(ReExecDaemonizer)),
            graceful: GracefulController::new(self.shutdown_timeout),
            inherit_addrs: self.inherit_addrs.clone(),
            inheritance: RwLock::new(Arc::new(Inheritance::new(self.inherit_addrs))),
            worker_command: self.worker_command,
            preset_config: Mutex::new(self.config),
            services: RwLock::new(Vec::new()),
            config: OnceLock::new(),
            log: OnceLock::new(),
            started_at: OnceLock::new(),
            setup_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            endpoint: Mutex::new(None),
        })
    }
}

pub struct Orchestrator {
    name: String,
    options: Options,
    model: ProcessModel,
    master: bool,
    pid_file: PidFile,
    control_socket: PathBuf,
    control: bool,
    before_stop: Option<BeforeStop>,
    manager: Arc<dyn ProcessManager>,
    daemonizer: Arc<dyn Daemonize>,
    graceful: GracefulController,
    inherit_addrs: Vec<String>,
    inheritance: RwLock<Arc<Inheritance>>,
    worker_command: Option<PathBuf>,
    preset_config: Mutex<Option<Config>>,
    services: RwLock<Vec<Arc<Service>>>,
    config: OnceLock<Arc<Config>>,
    log: OnceLock<&'static LogControl>,
    started_at: OnceLock<DateTime<Local>>,
    setup_started: AtomicBool,
    shutting_down: AtomicBool,
    endpoint: Mutex<Option<Endpoint>>,
}

impl Orchestrator {
    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            name: name.into(),
            options: Options::default(),
            model: None,
            master: None,
            pid_file: None,
            control_socket: None,
            control: true,
            before_stop: None,
            manager: None,
            daemonizer: None,
            inherit_addrs: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_command: None,
            config: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn model(&self) -> ProcessModel {
        self.model
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    /// The multi-process master supervises workers instead of running
    /// sandboxes itself.
    pub fn is_multi_master(&self) -> bool {
        self.model == ProcessModel::Multi && self.master
    }

    /// Writes the pid file and serves the control socket.
    fn is_primary(&self) -> bool {
        self.model == ProcessModel::Single || self.master
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    pub fn control_socket(&self) -> &std::path::Path {
        &self.control_socket
    }

    pub fn process_manager(&self) -> &Arc<dyn ProcessManager> {
        &self.manager
    }

    pub fn graceful(&self) -> &GracefulController {
        &self.graceful
    }

    pub fn config(&self) -> Option<Arc<Config>> {
        self.config.get().cloned()
    }

    pub fn log_control(&self) -> Option<&'static LogControl> {
        self.log.get().copied()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at.get().copied()
    }

    pub fn inheritance(&self) -> Arc<Inheritance> {
        Arc::clone(&self.inheritance.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Requests a graceful shutdown, as SIGTERM would.
    pub fn shutdown(&self) {
        self.graceful.shutdown();
    }

    /// Requests a reload, as SIGUSR2 would.
    pub fn reload(&self) {
        self.graceful.reload();
    }

    /// Registers `sandbox` into `service`, or into `"default"`.
    pub fn add_sandbox(
        &self,
        sandbox: Arc<dyn Sandbox>,
        service: Option<&str>,
    ) -> std::result::Result<Arc<SandboxContainer>, RegistryError> {
        validate_name(sandbox.name())?;
        let service_name = service.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SERVICE);
        let service = {
            let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
            match services.iter().find(|s| s.name() == service_name) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = Arc::new(Service::new(service_name));
                    services.push(Arc::clone(&created));
                    created
                }
            }
        };
        service.add_sandbox(sandbox)
    }

    /// Services in registration order.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services().into_iter().find(|s| s.name() == name)
    }

    /// First service holding a sandbox called `name`.
    pub fn find_sandbox(&self, name: &str) -> Option<(Arc<Service>, Arc<SandboxContainer>)> {
        self.services()
            .into_iter()
            .find_map(|s| s.container(name).map(|c| (s, c)))
    }

    /// Installs signal handlers, runs [`Orchestrator::setup`] and blocks
    /// until shutdown completes.
    pub async fn run<F>(self: &Arc<Self>, start: F) -> Result<SetupOutcome>
    where
        F: FnOnce(&Orchestrator) -> anyhow::Result<()>,
    {
        let signals = self.graceful.listen_signals()?;
        let outcome = self.setup(start).await;
        if !matches!(outcome, Ok(SetupOutcome::Running)) {
            signals.abort();
            return outcome;
        }
        self.wait().await?;
        signals.abort();
        Ok(SetupOutcome::Running)
    }

    /// Blocks until a terminate event finished the shutdown sequence.
    pub async fn wait(&self) -> Result<()> {
        self.graceful.wait(self).await?;
        Ok(())
    }

    /// One-time startup sequence for this process invocation.
    pub async fn setup<F>(self: &Arc<Self>, start: F) -> Result<SetupOutcome>
    where
        F: FnOnce(&Orchestrator) -> anyhow::Result<()>,
    {
        if self.setup_started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadySetup);
        }

        let preset = self.preset_config.lock().unwrap_or_else(|p| p.into_inner()).take();
        let config = match preset {
            Some(config) => config,
            None => Config::resolve(self.options.config.as_deref())?,
        };
        self.options.overlay(&config);
        let config = Arc::new(config);
        let _ = self.config.set(Arc::clone(&config));
        let _ = self.started_at.set(Local::now());

        // Workers are supervised children and never detach.
        if self.master
            && config.get_bool("Daemon")
            && !self
                .daemonizer
                .daemonize()
                .map_err(OrchestratorError::Daemonize)?
        {
            return Ok(SetupOutcome::Detached);
        }

        let log = logging::install(&LogPolicy::from_config(&config), &self.name)?;
        let _ = self.log.set(log);
        info!(
            name = %self.name,
            model = ?self.model,
            master = self.master,
            pid = std::process::id(),
            "setting up"
        );

        self.prepare_inheritance(&config)?;

        start(&**self).map_err(|e| OrchestratorError::Start(e.into()))?;

        if self.is_multi_master() {
            self.spawn_workers().await?;
        } else {
            self.start_sandboxes().await;
        }

        if self.is_primary() {
            self.pid_file
                .write()
                .map_err(|source| OrchestratorError::PidFile {
                    path: self.pid_file.path().to_path_buf(),
                    source,
                })?;
        }

        if self.control && self.is_primary() {
            let plane = ControlPlane::new(Arc::clone(self));
            let endpoint = ctl_server::serve(plane, self.control_socket.clone())
                .await
                .map_err(|source| OrchestratorError::Endpoint {
                    path: self.control_socket.clone(),
                    source,
                })?;
            *self.endpoint.lock().unwrap_or_else(|p| p.into_inner()) = Some(endpoint);
        }

        Ok(SetupOutcome::Running)
    }

    fn prepare_inheritance(&self, config: &Config) -> Result<()> {
        let mut addrs = self.inherit_addrs.clone();
        for addr in config.get_string_list("InheritAddr") {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        let inheritance = if self.master {
            Inheritance::new(addrs)
        } else {
            let mut adopted = Inheritance::from_env().map_err(OrchestratorError::Inheritance)?;
            adopted.extend(addrs);
            adopted
        };
        *self.inheritance.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(inheritance);
        Ok(())
    }

    async fn start_sandboxes(&self) {
        let filter = &self.options.names;
        for service in self.services() {
            let selected = effective_names(filter, &service.sandbox_names());
            for container in service.containers() {
                if !selected.iter().any(|n| n == container.name()) {
                    // Workers only keep the sandboxes they were spawned for.
                    if !self.master {
                        service.remove_sandbox(container.name());
                    }
                    continue;
                }
                match container.start().await {
                    Ok(()) => info!(service = %service.name(), sandbox = %container.name(), "sandbox started"),
                    Err(e) => warn!(service = %service.name(), sandbox = %container.name(), error = %e, "sandbox not started"),
                }
            }
        }
    }

    async fn spawn_workers(&self) -> Result<()> {
        let command = match self.worker_command.clone().map(Ok).unwrap_or_else(env::current_exe) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "cannot resolve worker executable, no worker spawned");
                return Ok(());
            }
        };

        let config = self.config().unwrap_or_else(|| Arc::new(Config::empty()));
        let inheritance = self.inheritance();
        let extra_files = if inheritance.is_enabled() {
            inheritance.bind_all().map_err(OrchestratorError::Inheritance)?;
            inheritance.extra_files().map_err(OrchestratorError::Inheritance)?
        } else {
            Vec::new()
        };

        for service in self.services() {
            let names = effective_names(&self.options.names, &service.sandbox_names());
            if names.is_empty() {
                debug!(service = %service.name(), "no sandbox selected, not spawned");
                continue;
            }

            let mut options = ProcOptions::new(service.name(), command.clone());
            options.args = self.options.worker_args(&names, &config);
            options.env = vec![(MASTER_ENV.to_string(), "false".to_string())];
            options.env.extend(inheritance.env());
            options.stdout = StdoutTarget::Inherit;
            options.auto_restart = true;
            options.stop_signals = vec![Signal::SIGQUIT, Signal::SIGTERM];
            options.stop_wait = worker_stop_wait(self.graceful.timeout(), options.stop_signals.len());
            options.extra_files = extra_files.clone();

            if let Err(e) = self.manager.new_process(options).await {
                warn!(service = %service.name(), error = %e, "worker not created");
                continue;
            }
            match self.manager.start_process(service.name(), false).await {
                Ok(_) => info!(service = %service.name(), sandboxes = %names.join(","), "worker spawned"),
                Err(e) => warn!(service = %service.name(), error = %e, "worker not started"),
            }
        }
        Ok(())
    }

    /// Restarts the worker of `service`: replacement first when listeners are
    /// inherited, stop-then-start otherwise.
    pub async fn reload_service(&self, service: &str) -> std::result::Result<bool, ProcessError> {
        if self.inheritance().is_enabled() {
            return self.manager.graceful_reload(service, true).await;
        }
        match self.manager.stop_process(service, true).await {
            Ok(_) | Err(ProcessError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.manager.start_process(service, true).await
    }

    async fn stop_workers(&self) {
        let mut stops = JoinSet::new();
        for service in self.services() {
            let manager = Arc::clone(&self.manager);
            let name = service.name().to_string();
            stops.spawn(async move {
                let result = manager.stop_process(&name, true).await;
                (name, result)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((_, Err(ProcessError::NotFound(_) | ProcessError::NotRunning(_)))) => {}
                Ok((name, Err(e))) => warn!(service = %name, error = %e, "worker stop failed"),
                Err(e) => warn!(error = %e, "worker stop task failed"),
            }
        }
    }

    fn close_endpoint(&self) {
        if let Some(endpoint) = self.endpoint.lock().unwrap_or_else(|p| p.into_inner()).take() {
            endpoint.shutdown();
        }
    }
}

#[async_trait]
impl GracefulHooks for Orchestrator {
    async fn first_sweep(&self) -> std::result::Result<bool, GracefulError> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        // The pid file belongs to the master; workers may share its path.
        let removed = if self.is_primary() {
            match self.pid_file.remove() {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(path = %self.pid_file.path().display(), error = %e, "pid file not removed");
                    false
                }
            }
        } else {
            false
        };

        if let Some(hook) = &self.before_stop {
            if !hook(self) {
                if removed {
                    if let Err(e) = self.pid_file.write() {
                        warn!(error = %e, "pid file not restored");
                    }
                }
                self.shutting_down.store(false, Ordering::SeqCst);
                return Err(GracefulError::Vetoed);
            }
        }
        Ok(true)
    }

    async fn before_exiting(&self) {
        self.close_endpoint();
        if self.is_multi_master() {
            self.stop_workers().await;
        }
        for service in self.services() {
            for container in service.containers() {
                container.teardown().await;
            }
        }
        info!(name = %self.name, "all sandboxes shut down");
    }

    async fn reload(&self) {
        if !self.is_multi_master() {
            warn!(model = ?self.model, "reload is only handled by a multi-process master");
            return;
        }
        for service in self.services() {
            match self.reload_service(service.name()).await {
                Ok(true) => info!(service = %service.name(), "worker reloaded"),
                Ok(false) => warn!(service = %service.name(), "worker reload reported failure"),
                Err(ProcessError::NotFound(_)) => debug!(service = %service.name(), "no worker to reload"),
                Err(e) => warn!(service = %service.name(), error = %e, "worker reload failed"),
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("master", &self.master)
            .field("services", &self.services())
            .finish()
    }
}
