//! Local control socket.
//!
//! Newline-delimited JSON over a unix socket. Each connection is one
//! session; a session that opened a logger also receives `log` frames
//! between replies until it closes the logger or disconnects.
//!
//! ```text
//! -> {"id":1,"call":{"method":"stop","params":{"name":"web"}}}
//! <- {"type":"reply","id":1,"result":{"Err":{"code":101,"message":"..."}}}
//! ```

use crate::control::{ControlPlane, SandboxInfo, Status, MALFORMED_REQUEST};
use crate::error::ClientError;
use crate::logging::{LogLevel, LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `<tmp>/<name>.sock`
pub fn socket_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!("{name}.sock"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    Info,
    Start { name: String },
    Stop { name: String },
    Reload { name: String },
    Debug { enable: bool },
    OpenLogger { level: LogLevel },
    CloseLogger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Info(Vec<SandboxInfo>),
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Reply {
        id: u64,
        result: Result<Reply, Status>,
    },
    Log(LogRecord),
}

/// A listening control socket. The socket file is removed on shutdown.
#[derive(Debug)]
pub struct Endpoint {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl Endpoint {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown(self) {
        self.task.abort();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "control socket not removed");
            }
        }
    }
}

pub async fn serve(plane: ControlPlane, path: PathBuf) -> io::Result<Endpoint> {
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "control socket listening");

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let plane = plane.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(plane, stream).await {
                            debug!(error = %e, "control session ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
    Ok(Endpoint { path, task })
}

async fn handle_session(plane: ControlPlane, stream: UnixStream) -> io::Result<()> {
    let session = Uuid::new_v4();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut logs: Option<mpsc::Receiver<LogRecord>> = None;
    debug!(%session, "control session opened");

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => Frame::Reply {
                        id: request.id,
                        result: dispatch(&plane, session, request.call, &mut logs).await,
                    },
                    Err(e) => Frame::Reply {
                        id: 0,
                        result: Err(Status::new(MALFORMED_REQUEST, e.to_string())),
                    },
                };
                if let Err(e) = write_frame(&mut write, &frame).await {
                    break Err(e);
                }
            }
            Some(record) = next_record(&mut logs) => {
                if let Err(e) = write_frame(&mut write, &Frame::Log(record)).await {
                    break Err(e);
                }
            }
        }
    };

    plane.session_closed(session);
    debug!(%session, "control session closed");
    result
}

async fn next_record(logs: &mut Option<mpsc::Receiver<LogRecord>>) -> Option<LogRecord> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn dispatch(
    plane: &ControlPlane,
    session: Uuid,
    call: Call,
    logs: &mut Option<mpsc::Receiver<LogRecord>>,
) -> Result<Reply, Status> {
    debug!(%session, ?call, "control call");
    match call {
        Call::Info => plane.info().await.map(Reply::Info),
        Call::Start { name } => plane.start(&name).await.map(|_| Reply::Ack),
        Call::Stop { name } => plane.stop(&name).await.map(|_| Reply::Ack),
        Call::Reload { name } => plane.reload(&name).await.map(|_| Reply::Ack),
        Call::Debug { enable } => plane.debug(enable).map(|_| Reply::Ack),
        Call::OpenLogger { level } => {
            *logs = Some(plane.open_logger(session, level)?);
            Ok(Reply::Ack)
        }
        Call::CloseLogger => {
            plane.close_logger(session)?;
            *logs = None;
            Ok(Reply::Ack)
        }
    }
}

async fn write_frame<W>(write: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    write.write_all(&line).await
}

/// Client side of the control socket.
pub struct CtlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    next_id: u64,
    logs: VecDeque<LogRecord>,
}

impl CtlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
            next_id: 1,
            logs: VecDeque::new(),
        })
    }

    async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
            if !line.trim().is_empty() {
                return Ok(serde_json::from_str(&line)?);
            }
        }
    }

    /// Sends `call` and waits for its reply. Log frames that arrive first
    /// are kept for [`CtlClient::next_log`].
    pub async fn call(&mut self, call: Call) -> Result<Reply, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_vec(&Request { id, call })?;
        line.push(b'\n');
        self.write.write_all(&line).await?;

        loop {
            match self.read_frame().await? {
                Frame::Log(record) => self.logs.push_back(record),
                Frame::Reply { id: reply_id, result } if reply_id == id || reply_id == 0 => {
                    return Ok(result?);
                }
                Frame::Reply { id: other, .. } => debug!(id = other, "dropping stale reply"),
            }
        }
    }

    pub async fn info(&mut self) -> Result<Vec<SandboxInfo>, ClientError> {
        match self.call(Call::Info).await? {
            Reply::Info(infos) => Ok(infos),
            Reply::Ack => Ok(Vec::new()),
        }
    }

    pub async fn start(&mut self, name: &str) -> Result<(), ClientError> {
        self.call(Call::Start { name: name.to_string() }).await.map(drop)
    }

    pub async fn stop(&mut self, name: &str) -> Result<(), ClientError> {
        self.call(Call::Stop { name: name.to_string() }).await.map(drop)
    }

    pub async fn reload(&mut self, name: &str) -> Result<(), ClientError> {
        self.call(Call::Reload { name: name.to_string() }).await.map(drop)
    }

    pub async fn debug(&mut self, enable: bool) -> Result<(), ClientError> {
        self.call(Call::Debug { enable }).await.map(drop)
    }

    pub async fn open_logger(&mut self, level: LogLevel) -> Result<(), ClientError> {
        self.call(Call::OpenLogger { level }).await.map(drop)
    }

    pub async fn close_logger(&mut self) -> Result<(), ClientError> {
        self.call(Call::CloseLogger).await.map(drop)
    }

    /// The next streamed log record; `None` once the server hung up.
    pub async fn next_log(&mut self) -> Result<Option<LogRecord>, ClientError> {
        if let Some(record) = self.logs.pop_front() {
            return Ok(Some(record));
        }
        loop {
            match self.read_frame().await {
                Ok(Frame::Log(record)) => return Ok(Some(record)),
                Ok(Frame::Reply { id, .. }) => debug!(id, "unexpected reply while streaming"),
                Err(ClientError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
