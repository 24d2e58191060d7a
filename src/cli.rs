//! Command-line model and the options resolved from it.

use crate::config::Config;
use crate::logging::LogLevel;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "sandboxd")]
#[command(about = "Sandbox orchestration runtime", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Environment name (dev, test, production)
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Config file path, or a file name searched next to the binary
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Maximal verbosity with console echo
    #[arg(long, global = true)]
    pub debug: bool,

    /// Detach from the terminal
    #[arg(short = 'd', long, global = true)]
    pub daemon: bool,

    /// Execution model
    #[arg(long, global = true, value_enum)]
    pub model: Option<ProcessModel>,

    /// Pid file location (defaults to <tmp>/<name>.pid)
    #[arg(long, global = true)]
    pub pid_file: Option<PathBuf>,

    /// Do not open the local control socket
    #[arg(long, global = true)]
    pub no_ctl: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run sandboxes (all of them when NAMES is omitted)
    Start {
        /// Comma-separated sandbox names
        names: Option<String>,
    },
    /// Ask the running instance to shut down
    Stop,
    /// Ask the running instance to reload its workers
    Reload,
    /// Talk to the running instance over its control socket
    Ctl {
        #[command(subcommand)]
        call: CtlCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CtlCommand {
    /// List sandboxes and their status
    Info,
    Start { name: String },
    Stop { name: String },
    Reload { name: String },
    /// Toggle debug verbosity and persist it
    Debug {
        #[arg(action = ArgAction::Set)]
        enable: bool,
    },
    /// Stream log records until interrupted
    Logs {
        #[arg(long, default_value = "debug")]
        level: LogLevel,
    },
}

/// How sandboxes are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProcessModel {
    /// Every sandbox runs as a task inside this process
    #[default]
    Single,
    /// One supervised OS process per service
    Multi,
}

/// Embedder-facing view of the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub model: Option<ProcessModel>,
    pub env: Option<String>,
    pub config: Option<String>,
    pub debug: bool,
    pub daemon: bool,
    /// Empty selects every registered sandbox.
    pub names: Vec<String>,
    pub pid_file: Option<PathBuf>,
    pub disable_control: bool,
}

impl Options {
    pub fn from_args(args: &Args) -> Self {
        let names = match &args.command {
            Some(Commands::Start { names: Some(names) }) => parse_names(names),
            _ => Vec::new(),
        };
        Self {
            model: args.model,
            env: args.env.clone(),
            config: args.config.clone(),
            debug: args.debug,
            daemon: args.daemon,
            names,
            pid_file: args.pid_file.clone(),
            disable_control: args.no_ctl,
        }
    }

    /// Command-line flags override the matching config keys in memory.
    pub fn overlay(&self, config: &Config) {
        if let Some(env) = &self.env {
            config.set("ENV_NAME", Value::String(env.clone()));
        }
        if self.debug {
            config.set("Debug", Value::Bool(true));
        }
        if self.daemon {
            config.set("Daemon", Value::Bool(true));
        }
    }

    /// `start <names> [--env=] [--config=] [--debug]`, with environment and
    /// debug taken from the resolved `config`.
    pub fn worker_args(&self, names: &[String], config: &Config) -> Vec<String> {
        let mut args = vec!["start".to_string(), names.join(",")];
        if let Some(env) = config.get_string("ENV_NAME").filter(|e| !e.is_empty()) {
            args.push(format!("--env={env}"));
        }
        match (config.path(), &self.config) {
            (Some(path), _) => args.push(format!("--config={}", path.display())),
            (None, Some(config)) => args.push(format!("--config={config}")),
            (None, None) => {}
        }
        if config.get_bool("Debug") {
            args.push("--debug".to_string());
        }
        args
    }
}

pub fn parse_names(names: &str) -> Vec<String> {
    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}
