//! Control-plane operations over a running orchestrator.
//!
//! In the single-process model calls act on in-memory containers. In the
//! multi-process model they are routed to the process manager by the name of
//! the service that owns the sandbox, so `start`/`stop`/`reload` affect the
//! whole worker process of that service.

use crate::cli::ProcessModel;
use crate::error::{ConfigError, ContainerError, ProcessError};
use crate::logging::{LogLevel, LogRecord};
use crate::orchestrator::Orchestrator;
use crate::process::uptime_description;
use crate::sandbox::{ContainerStatus, SandboxContainer, SandboxState};
use crate::service::Service;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MISSING_ARGUMENT: u16 = 100;
pub const NOT_FOUND: u16 = 101;
pub const FAILED: u16 = 102;
pub const NOT_OK: u16 = 103;
pub const MALFORMED_REQUEST: u16 = 104;

/// Failure reported to a control caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct Status {
    pub code: u16,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn failed(err: impl std::fmt::Display) -> Self {
        Self::new(FAILED, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox: String,
    pub service: String,
    pub status: String,
    pub description: String,
}

#[derive(Clone)]
pub struct ControlPlane {
    orchestrator: Arc<Orchestrator>,
}

impl ControlPlane {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn multi(&self) -> bool {
        self.orchestrator.model() == ProcessModel::Multi
    }

    fn locate(&self, name: &str) -> Result<(Arc<Service>, Arc<SandboxContainer>), Status> {
        if name.trim().is_empty() {
            return Err(Status::new(MISSING_ARGUMENT, "sandbox name is required"));
        }
        self.orchestrator
            .find_sandbox(name)
            .ok_or_else(|| Status::new(NOT_FOUND, format!("sandbox [{name}] not found")))
    }

    pub async fn info(&self) -> Result<Vec<SandboxInfo>, Status> {
        let mut infos = Vec::new();
        for service in self.orchestrator.services() {
            if self.multi() {
                let (status, description) = match self
                    .orchestrator
                    .process_manager()
                    .process_info(service.name())
                    .await
                {
                    Ok(info) => (info.state_name().to_string(), info.description),
                    Err(ProcessError::NotFound(_)) => (SandboxState::Unknown.to_string(), String::new()),
                    Err(e) => return Err(Status::failed(e)),
                };
                for name in service.sandbox_names() {
                    infos.push(SandboxInfo {
                        sandbox: name,
                        service: service.name().to_string(),
                        status: status.clone(),
                        description: description.clone(),
                    });
                }
            } else {
                for container in service.containers() {
                    let status = container.status();
                    infos.push(SandboxInfo {
                        sandbox: container.name().to_string(),
                        service: service.name().to_string(),
                        status: status.state.to_string(),
                        description: describe(&status),
                    });
                }
            }
        }
        Ok(infos)
    }

    pub async fn start(&self, name: &str) -> Result<(), Status> {
        let (service, _) = self.locate(name)?;
        if self.multi() {
            return self.delegate(
                self.orchestrator
                    .process_manager()
                    .start_process(service.name(), true)
                    .await,
                service.name(),
                "start",
            );
        }
        match service.start_sandbox(name).await {
            Ok(()) => {
                info!(sandbox = name, "started by control request");
                Ok(())
            }
            Err(ContainerError::NotFound(_)) => Err(Status::new(NOT_FOUND, format!("sandbox [{name}] not found"))),
            Err(e) => Err(Status::failed(e)),
        }
    }

    /// Stopping a sandbox that is not running succeeds without effect.
    pub async fn stop(&self, name: &str) -> Result<(), Status> {
        let (service, _) = self.locate(name)?;
        if self.multi() {
            return self.delegate(
                self.orchestrator
                    .process_manager()
                    .stop_process(service.name(), true)
                    .await,
                service.name(),
                "stop",
            );
        }
        match service.stop_sandbox(name).await {
            Ok(_) => {
                info!(sandbox = name, "stopped by control request");
                Ok(())
            }
            Err(ContainerError::NotFound(_)) => Err(Status::new(NOT_FOUND, format!("sandbox [{name}] not found"))),
            Err(e) => Err(Status::failed(e)),
        }
    }

    pub async fn reload(&self, name: &str) -> Result<(), Status> {
        let (service, _) = self.locate(name)?;
        if !self.multi() {
            return Err(Status::failed("reload is not supported in the single-process model"));
        }
        self.delegate(
            self.orchestrator.reload_service(service.name()).await,
            service.name(),
            "reload",
        )
    }

    fn delegate(
        &self,
        result: Result<bool, ProcessError>,
        service: &str,
        action: &str,
    ) -> Result<(), Status> {
        match result {
            Ok(true) => {
                info!(service, action, "worker handled control request");
                Ok(())
            }
            Ok(false) => Err(Status::new(NOT_OK, format!("{action} [{service}] was not ok"))),
            Err(e) => {
                warn!(service, action, error = %e, "worker control request failed");
                Err(Status::failed(e))
            }
        }
    }

    /// Toggles debug verbosity and persists `Debug` into the config file.
    /// A config without a backing file only changes in memory.
    pub fn debug(&self, enable: bool) -> Result<(), Status> {
        if let Some(log) = self.orchestrator.log_control() {
            log.set_debug(enable);
        }
        let Some(config) = self.orchestrator.config() else {
            return Ok(());
        };
        match config.store("Debug", Value::Bool(enable)) {
            Ok(()) => Ok(()),
            Err(ConfigError::NotFileBacked) => {
                config.set("Debug", Value::Bool(enable));
                Ok(())
            }
            Err(e) => Err(Status::failed(e)),
        }
    }

    pub fn open_logger(
        &self,
        session: Uuid,
        level: LogLevel,
    ) -> Result<mpsc::Receiver<LogRecord>, Status> {
        let log = self
            .orchestrator
            .log_control()
            .ok_or_else(|| Status::failed("logging is not installed"))?;
        Ok(log.attach(session, level))
    }

    pub fn close_logger(&self, session: Uuid) -> Result<(), Status> {
        if let Some(log) = self.orchestrator.log_control() {
            log.detach(session);
        }
        Ok(())
    }

    /// Called by the transport when a session disconnects.
    pub fn session_closed(&self, session: Uuid) {
        if let Some(log) = self.orchestrator.log_control() {
            log.detach(session);
        }
    }
}

fn describe(status: &ContainerStatus) -> String {
    match status.state {
        SandboxState::Running => {
            let uptime = status
                .started_at
                .and_then(|t| (Local::now() - t).to_std().ok())
                .unwrap_or_default();
            uptime_description(std::process::id(), uptime)
        }
        SandboxState::Stopped => String::new(),
        _ => status
            .stopped_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn running_description_uses_uptime() {
        let status = ContainerStatus {
            state: SandboxState::Running,
            started_at: Some(Local::now() - ChronoDuration::seconds(65)),
            stopped_at: None,
        };
        let text = describe(&status);
        assert!(text.starts_with(&format!("pid {}, uptime 0:01:0", std::process::id())));
    }

    #[test]
    fn stopped_description_is_empty() {
        let status = ContainerStatus {
            state: SandboxState::Stopped,
            started_at: Some(Local::now()),
            stopped_at: Some(Local::now()),
        };
        assert_eq!(describe(&status), "");
    }

    #[test]
    fn other_states_show_stop_time() {
        let status = ContainerStatus {
            state: SandboxState::Unknown,
            started_at: None,
            stopped_at: None,
        };
        assert_eq!(describe(&status), "");

        let stopped_at = Local::now();
        let status = ContainerStatus {
            state: SandboxState::Stopping,
            started_at: None,
            stopped_at: Some(stopped_at),
        };
        assert_eq!(describe(&status), stopped_at.format("%Y-%m-%d %H:%M:%S").to_string());
    }

    #[test]
    fn status_display() {
        let status = Status::new(NOT_FOUND, "sandbox [x] not found");
        assert_eq!(status.to_string(), "[101] sandbox [x] not found");
    }
}
