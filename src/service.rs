//! Services: named, ordered groups of sandbox containers.

use crate::error::{ContainerError, RegistryError};
use crate::sandbox::{Sandbox, SandboxContainer};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Service used when a sandbox is registered without one.
pub const DEFAULT_SERVICE: &str = "default";

/// A named group of sandbox containers.
///
/// In the multi-process model a service is the unit of OS-process
/// granularity: one worker process runs every sandbox of one service.
/// Containers keep registration order, which is also teardown order.
pub struct Service {
    name: String,
    containers: RwLock<Vec<Arc<SandboxContainer>>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            containers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<SandboxContainer>>> {
        self.containers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<SandboxContainer>>> {
        self.containers.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_sandbox(&self, sandbox: Arc<dyn Sandbox>) -> Result<Arc<SandboxContainer>, RegistryError> {
        let container = Arc::new(SandboxContainer::new(sandbox)?);
        let mut containers = self.write();
        if containers.iter().any(|c| c.name() == container.name()) {
            return Err(RegistryError::DuplicateSandbox {
                service: self.name.clone(),
                name: container.name().to_string(),
            });
        }
        containers.push(Arc::clone(&container));
        debug!(service = %self.name, sandbox = %container.name(), "sandbox registered");
        Ok(container)
    }

    pub fn search_sandbox(&self, name: &str) -> Option<Arc<dyn Sandbox>> {
        self.container(name).map(|c| Arc::clone(c.sandbox()))
    }

    pub fn container(&self, name: &str) -> Option<Arc<SandboxContainer>> {
        self.read().iter().find(|c| c.name() == name).cloned()
    }

    pub fn containers(&self) -> Vec<Arc<SandboxContainer>> {
        self.read().clone()
    }

    pub fn sandbox_names(&self) -> Vec<String> {
        self.read().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().iter().any(|c| c.name() == name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub async fn start_sandbox(&self, name: &str) -> Result<(), ContainerError> {
        let container = self
            .container(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        container.start().await
    }

    /// Returns whether the sandbox was running.
    pub async fn stop_sandbox(&self, name: &str) -> Result<bool, ContainerError> {
        let container = self
            .container(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        container.stop().await
    }

    /// Deregisters without calling `shutdown`.
    pub fn remove_sandbox(&self, name: &str) -> Option<Arc<SandboxContainer>> {
        let mut containers = self.write();
        let index = containers.iter().position(|c| c.name() == name)?;
        Some(containers.remove(index))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("sandboxes", &self.sandbox_names())
            .finish()
    }
}
