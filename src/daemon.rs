//! Detaching from the terminal and the pid file.

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, setsid, Pid};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Set in the environment of the re-executed background process.
pub const DAEMON_ENV: &str = "SANDBOXD_DAEMONIZED";

pub trait Daemonize: Send + Sync {
    /// `Ok(true)` means keep running in this process. `Ok(false)` means a
    /// detached copy was started and the caller should exit with status 0.
    fn daemonize(&self) -> io::Result<bool>;
}

/// Re-executes the current binary in a new session with stdio on
/// `/dev/null` and without the daemon flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReExecDaemonizer;

impl Daemonize for ReExecDaemonizer {
    fn daemonize(&self) -> io::Result<bool> {
        if env::var_os(DAEMON_ENV).is_some() || getppid() == Pid::from_raw(1) {
            debug!("already running in the background");
            return Ok(true);
        }

        let exe = env::current_exe()?;
        let mut cmd = Command::new(&exe);
        cmd.args(strip_daemon_flags(env::args_os().skip(1)))
            .env(DAEMON_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }
        let child = cmd.spawn()?;
        info!(pid = child.id(), exe = %exe.display(), "detached into background");
        Ok(false)
    }
}

pub fn strip_daemon_flags(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .filter(|a| a != "-d" && a != "--daemon")
        .collect()
}

/// Plain text file holding the decimal pid of the running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<tmp>/<name>.pid`
    pub fn for_name(name: &str) -> Self {
        Self::new(env::temp_dir().join(format!("{name}.pid")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Truncates and writes the current pid.
    pub fn write(&self) -> io::Result<()> {
        self.write_pid(std::process::id())
    }

    pub fn write_pid(&self, pid: u32) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, pid.to_string())
    }

    /// Returns whether a file was removed.
    pub fn remove(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn read(&self) -> io::Result<u32> {
        let text = fs::read_to_string(&self.path)?;
        text.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", self.path.display())))
    }

    /// Sends `signal` to the recorded pid and returns it.
    pub fn signal(&self, signal: Signal) -> io::Result<u32> {
        let pid = self.read()?;
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), signal)?;
        Ok(pid)
    }
}
