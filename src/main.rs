//! sandboxd - demo runtime embedding two sandboxes.
//!
//! Usage:
//!   sandboxd [start [NAMES]] [--model multi] [-d]   # Run sandboxes
//!   sandboxd stop | reload                          # Signal the running instance
//!   sandboxd ctl info | start <n> | stop <n> | ...  # Control socket client

#[cfg(not(unix))]
compile_error!("This program only works on unix platforms.");

use async_trait::async_trait;
use clap::Parser;
use nix::sys::signal::Signal;
use sandboxd::cli::{Args, Commands, CtlCommand};
use sandboxd::ctl_server::{self, CtlClient};
use sandboxd::daemon::PidFile;
use sandboxd::error::ClientError;
use sandboxd::graceful::Inheritance;
use sandboxd::{Options, Orchestrator, Sandbox, SetupOutcome};
use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

const NAME: &str = "sandboxd";
const ECHO_ADDR: &str = "127.0.0.1:7878";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command.clone() {
        Some(Commands::Stop) => signal_instance(&args, Signal::SIGTERM),
        Some(Commands::Reload) => signal_instance(&args, Signal::SIGUSR2),
        Some(Commands::Ctl { call }) => {
            if let Err(e) = run_ctl(call).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Some(Commands::Start { .. }) | None => run(&args).await,
    }
}

async fn run(args: &Args) {
    let orchestrator = Orchestrator::builder(NAME)
        .options(Options::from_args(args))
        .inherit_addr(ECHO_ADDR)
        .build();

    let result = orchestrator
        .run(|o| {
            let echo = EchoSandbox::new(ECHO_ADDR, o.inheritance());
            o.add_sandbox(Arc::new(echo), Some("net"))?;
            o.add_sandbox(Arc::new(HeartbeatSandbox::new(Duration::from_secs(30))), Some("cron"))?;
            Ok(())
        })
        .await;

    match result {
        Ok(SetupOutcome::Running) => info!("bye"),
        Ok(SetupOutcome::Detached) => exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    }
}

fn signal_instance(args: &Args, signal: Signal) {
    let pid_file = args
        .pid_file
        .clone()
        .map(PidFile::new)
        .unwrap_or_else(|| PidFile::for_name(NAME));
    match pid_file.signal(signal) {
        Ok(pid) => println!("sent {} to {}", signal, pid),
        Err(e) => {
            eprintln!("Error: {}: {}", pid_file.path().display(), e);
            exit(1);
        }
    }
}

async fn run_ctl(call: CtlCommand) -> Result<(), ClientError> {
    let mut client = CtlClient::connect(ctl_server::socket_path(NAME)).await?;
    match call {
        CtlCommand::Info => {
            println!("{:<20} {:<12} {:<10} DESCRIPTION", "SANDBOX", "SERVICE", "STATUS");
            for info in client.info().await? {
                println!(
                    "{:<20} {:<12} {:<10} {}",
                    info.sandbox, info.service, info.status, info.description
                );
            }
        }
        CtlCommand::Start { name } => client.start(&name).await?,
        CtlCommand::Stop { name } => client.stop(&name).await?,
        CtlCommand::Reload { name } => client.reload(&name).await?,
        CtlCommand::Debug { enable } => client.debug(enable).await?,
        CtlCommand::Logs { level } => {
            client.open_logger(level).await?;
            loop {
                tokio::select! {
                    record = client.next_log() => match record? {
                        Some(r) => println!("{} {:>5} {}: {}", r.time, r.level, r.target, r.message),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        client.close_logger().await?;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Stop signal for whatever `setup` run is current.
#[derive(Default)]
struct StopHandle(Mutex<Option<oneshot::Sender<()>>>);

impl StopHandle {
    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    fn fire(&self) {
        if let Some(tx) = self.0.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

/// TCP echo server on a listener that survives worker reloads.
struct EchoSandbox {
    addr: String,
    inheritance: Arc<Inheritance>,
    stop: StopHandle,
}

impl EchoSandbox {
    fn new(addr: &str, inheritance: Arc<Inheritance>) -> Self {
        Self {
            addr: addr.to_string(),
            inheritance,
            stop: StopHandle::default(),
        }
    }
}

#[async_trait]
impl Sandbox for EchoSandbox {
    fn name(&self) -> &str {
        "echo"
    }

    async fn setup(&self) -> anyhow::Result<()> {
        let mut stop = self.stop.arm();
        let listener = self.inheritance.listener(&self.addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        info!(addr = %self.addr, "echo listening");

        loop {
            tokio::select! {
                _ = &mut stop => return Ok(()),
                accepted = listener.accept() => {
                    let (mut stream, peer) = accepted?;
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if stream.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!(%peer, error = %e, "echo connection failed");
                                    break;
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.stop.fire();
        Ok(())
    }
}

/// Logs a line at a fixed period.
struct HeartbeatSandbox {
    period: Duration,
    stop: StopHandle,
}

impl HeartbeatSandbox {
    fn new(period: Duration) -> Self {
        Self {
            period,
            stop: StopHandle::default(),
        }
    }
}

#[async_trait]
impl Sandbox for HeartbeatSandbox {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn setup(&self) -> anyhow::Result<()> {
        let mut stop = self.stop.arm();
        let mut ticker = tokio::time::interval(self.period);
        let mut beats: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut stop => return Ok(()),
                _ = ticker.tick() => {
                    beats += 1;
                    info!(beats, pid = std::process::id(), "heartbeat");
                }
            }
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.stop.fire();
        Ok(())
    }
}
