//! Logging policy and the process-wide `tracing` subscriber.
//!
//! The subscriber is a registry with three layers: console output, an
//! optional append-only file, and [`SessionSinks`], which forwards events to
//! control sessions that asked for a log stream. Console and file share one
//! verbosity cell that can be changed at runtime.

use crate::config::Config;
use crate::error::LoggingError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{debug, Event, Level, Subscriber};
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both `tracing` names and the `logger.Level` vocabulary
/// (`ALL`, `DEVELOP`, `PRODUCT`).
impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "trace" => Ok(LogLevel::Trace),
            "develop" | "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "product" | "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Verbosity and destinations derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPolicy {
    pub level: LogLevel,
    pub stdout: bool,
    /// Directory receiving `<name>.log`.
    pub path: Option<PathBuf>,
    /// Overrides `level` with `Trace` and forces console output.
    pub debug: bool,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            stdout: true,
            path: None,
            debug: false,
        }
    }
}

impl LogPolicy {
    pub fn from_config(config: &Config) -> Self {
        let env = config.get_string("ENV_NAME").unwrap_or_default().to_ascii_lowercase();
        let (mut level, mut stdout) = match env.as_str() {
            "dev" | "develop" => (LogLevel::Debug, true),
            "test" => (LogLevel::Info, false),
            _ => (LogLevel::Warn, false),
        };
        if let Some(configured) = config
            .get_string("logger.Level")
            .and_then(|l| l.parse::<LogLevel>().ok())
        {
            level = configured;
        }

        let path = config
            .get_string("logger.Path")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        if path.is_none() {
            stdout = true;
        }

        Self {
            level,
            stdout,
            path,
            debug: config.get_bool("Debug"),
        }
    }

    pub fn effective_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Trace
        } else {
            self.level
        }
    }

    pub fn effective_stdout(&self) -> bool {
        self.debug || self.stdout
    }
}

/// One log event as delivered to a control session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// Records buffered per session before new ones are dropped.
pub const SESSION_BUFFER: usize = 1024;

struct Sink {
    level: LevelFilter,
    tx: mpsc::Sender<LogRecord>,
    dropped: AtomicU64,
}

/// Fan-out of log events to attached control sessions, keyed by session id.
///
/// Each session has a bounded buffer. A session that stops reading loses
/// records instead of growing the buffer; the loss is counted and reported
/// when the session detaches.
#[derive(Clone, Default)]
pub struct SessionSinks {
    inner: Arc<RwLock<HashMap<Uuid, Sink>>>,
}

impl SessionSinks {
    pub fn attach(&self, session: Uuid, level: LogLevel) -> mpsc::Receiver<LogRecord> {
        self.attach_with_capacity(session, level, SESSION_BUFFER)
    }

    pub fn attach_with_capacity(
        &self,
        session: Uuid,
        level: LogLevel,
        capacity: usize,
    ) -> mpsc::Receiver<LogRecord> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut sinks = self.inner.write().unwrap_or_else(|p| p.into_inner());
        sinks.insert(
            session,
            Sink {
                level: level.filter(),
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        rx
    }

    pub fn detach(&self, session: Uuid) -> bool {
        let removed = {
            let mut sinks = self.inner.write().unwrap_or_else(|p| p.into_inner());
            sinks.remove(&session)
        };
        match removed {
            Some(sink) => {
                let dropped = sink.dropped.load(Ordering::Relaxed);
                if dropped > 0 {
                    debug!(%session, dropped, "log session lost records");
                }
                true
            }
            None => false,
        }
    }

    /// Records dropped so far for `session` because its buffer was full.
    pub fn dropped(&self, session: Uuid) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&session)
            .map_or(0, |s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Subscriber> Layer<S> for SessionSinks {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let sinks = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let level = *event.metadata().level();
        if !sinks.values().any(|s| level <= s.level) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            time: Local::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.finish(),
        };
        for sink in sinks.values().filter(|s| level <= s.level) {
            // A closed receiver is detached when its session ends.
            if let Err(TrySendError::Full(_)) = sink.tx.try_send(record.clone()) {
                sink.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Append-only log file that can be opened after the subscriber exists.
#[derive(Clone, Default)]
struct FileWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl FileWriter {
    fn is_open(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    fn replace(&self, file: Option<File>) {
        *self.file.lock().unwrap_or_else(|p| p.into_inner()) = file;
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileWriter {
    type Writer = FileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runtime handle over the installed subscriber.
pub struct LogControl {
    level: Arc<AtomicU8>,
    stdout: Arc<AtomicBool>,
    file: FileWriter,
    sinks: SessionSinks,
    policy: Mutex<LogPolicy>,
    installed: AtomicBool,
}

impl Default for LogControl {
    fn default() -> Self {
        Self::new()
    }
}

impl LogControl {
    pub fn new() -> Self {
        let policy = LogPolicy::default();
        Self {
            level: Arc::new(AtomicU8::new(policy.effective_level() as u8)),
            stdout: Arc::new(AtomicBool::new(policy.effective_stdout())),
            file: FileWriter::default(),
            sinks: SessionSinks::default(),
            policy: Mutex::new(policy),
            installed: AtomicBool::new(false),
        }
    }

    /// The layered subscriber driven by this handle.
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        let console_level = Arc::clone(&self.level);
        let console_on = Arc::clone(&self.stdout);
        let console = tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .with_filter(dynamic_filter_fn(move |meta, _cx| {
                console_on.load(Ordering::Relaxed)
                    && enabled(&console_level, meta.level())
            }));

        let file_level = Arc::clone(&self.level);
        let file_writer = self.file.clone();
        let file = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(self.file.clone())
            .with_filter(dynamic_filter_fn(move |meta, _cx| {
                enabled(&file_level, meta.level()) && file_writer.is_open()
            }));

        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .with(self.sinks.clone())
    }

    /// Applies `policy`, opening `<path>/<name>.log` when a path is set.
    pub fn apply(&self, policy: &LogPolicy, name: &str) -> Result<(), LoggingError> {
        let file = match &policy.path {
            Some(dir) => {
                let path = dir.join(format!("{name}.log"));
                let file = fs::create_dir_all(dir)
                    .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
                    .map_err(|source| LoggingError::File { path, source })?;
                Some(file)
            }
            None => None,
        };
        self.file.replace(file);
        *self.policy.lock().unwrap_or_else(|p| p.into_inner()) = policy.clone();
        self.refresh(policy);
        Ok(())
    }

    /// `true` forces trace verbosity with console echo; `false` restores
    /// the configured policy.
    pub fn set_debug(&self, enable: bool) {
        let mut policy = self.policy.lock().unwrap_or_else(|p| p.into_inner());
        policy.debug = enable;
        self.refresh(&policy);
        debug!(enable, "debug verbosity changed");
    }

    fn refresh(&self, policy: &LogPolicy) {
        self.level.store(policy.effective_level() as u8, Ordering::Relaxed);
        self.stdout.store(policy.effective_stdout(), Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_index(self.level.load(Ordering::Relaxed))
    }

    pub fn is_debug(&self) -> bool {
        self.policy.lock().map(|p| p.debug).unwrap_or(false)
    }

    pub fn attach(&self, session: Uuid, level: LogLevel) -> mpsc::Receiver<LogRecord> {
        self.sinks.attach(session, level)
    }

    pub fn detach(&self, session: Uuid) -> bool {
        self.sinks.detach(session)
    }

    pub fn sessions(&self) -> usize {
        self.sinks.len()
    }
}

fn enabled(cell: &AtomicU8, level: &Level) -> bool {
    *level <= LogLevel::from_index(cell.load(Ordering::Relaxed)).filter()
}

static CONTROL: OnceLock<LogControl> = OnceLock::new();

/// Installs the global subscriber on first use, then applies `policy`.
///
/// When another global subscriber was installed first, the handle still
/// tracks policy but its layers receive no events.
pub fn install(policy: &LogPolicy, name: &str) -> Result<&'static LogControl, LoggingError> {
    let control = CONTROL.get_or_init(LogControl::new);
    if !control.installed.swap(true, Ordering::SeqCst) && control.subscriber().try_init().is_err() {
        debug!("a global subscriber is already installed");
    }
    control.apply(policy, name)?;
    Ok(control)
}

/// The handle created by [`install`], if any.
pub fn control() -> Option<&'static LogControl> {
    CONTROL.get()
}
