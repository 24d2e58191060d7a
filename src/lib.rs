//! sandboxd - run groups of long-lived sandboxes in one process or as one
//! supervised process per service, with graceful reload and a local
//! control socket.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sandboxd::{Orchestrator, Sandbox};
//!
//! struct Ticker;
//!
//! #[async_trait::async_trait]
//! impl Sandbox for Ticker {
//!     fn name(&self) -> &str { "ticker" }
//!     async fn setup(&self) -> anyhow::Result<()> { Ok(()) }
//!     async fn shutdown(&self) -> anyhow::Result<()> { Ok(()) }
//! }
//!
//! # async fn demo() -> sandboxd::Result<()> {
//! let orchestrator = Orchestrator::builder("ticker").build();
//! orchestrator
//!     .run(|o| {
//!         o.add_sandbox(Arc::new(Ticker), None)?;
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("sandboxd only works on unix platforms.");

pub mod cli;
pub mod config;
pub mod control;
pub mod ctl_server;
pub mod daemon;
pub mod error;
pub mod graceful;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod sandbox;
pub mod service;

pub use cli::{Options, ProcessModel};
pub use config::Config;
pub use control::{ControlPlane, SandboxInfo, Status};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SetupOutcome};
pub use process::{LocalProcessManager, ProcOptions, ProcessManager};
pub use sandbox::{Sandbox, SandboxContainer, SandboxState};
pub use service::Service;
