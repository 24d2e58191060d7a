//! Error types for every layer of the runtime.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error carried across embedder boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Registration of sandboxes into services.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sandbox [{name}] already exists in service [{service}]")]
    DuplicateSandbox { service: String, name: String },

    /// Names travel comma-joined in worker argv, so they must be non-empty and comma-free.
    #[error("invalid sandbox name {0:?}")]
    InvalidName(String),
}

/// Lifecycle transitions of a single sandbox container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("sandbox [{0}] not found")]
    NotFound(String),

    #[error("sandbox [{0}] is already running")]
    AlreadyRunning(String),

    #[error("sandbox [{name}] shutdown failed: {source}")]
    Shutdown {
        name: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config is not backed by a file")]
    NotFileBacked,
}

/// Failures reported by a [`crate::process::ProcessManager`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process [{0}] not found")]
    NotFound(String),

    #[error("process [{0}] already exists")]
    AlreadyExists(String),

    #[error("process [{0}] is already started")]
    AlreadyStarted(String),

    #[error("process [{0}] is not running")]
    NotRunning(String),

    #[error("failed to spawn [{name}]: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal [{name}]: {source}")]
    Signal {
        name: String,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, Error)]
pub enum GracefulError {
    #[error("before-stop hook vetoed the shutdown")]
    Vetoed,

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("event channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures of [`crate::ctl_server::CtlClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control socket: {0}")]
    Io(#[from] io::Error),

    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Status(#[from] crate::control::Status),

    #[error("control socket closed")]
    Closed,
}

/// Fatal startup and runtime errors of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Graceful(#[from] GracefulError),

    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("daemonize failed: {0}")]
    Daemonize(#[source] io::Error),

    #[error("control endpoint {path}: {source}")]
    Endpoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("inherited listeners: {0}")]
    Inheritance(#[source] io::Error),

    #[error("start callback failed: {0}")]
    Start(#[source] BoxError),

    #[error("setup already ran")]
    AlreadySetup,
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
