//! Worker transports
//!
//! A transport is a request channel into the worker and a message channel out
//! of it. The message channel ending means the worker is gone. Process-backed
//! transports carry newline-delimited JSON over the child's stdio; the same
//! line reader/writer serves any `AsyncRead` / `AsyncWrite` pair.

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runtime::{PublishRunner, WorkerRuntime};
use crate::error::{Error, Result};
use crate::protocol::{WorkerMessage, WorkerRequest};

/// Buffered frames per direction
const CHANNEL_CAPACITY: usize = 64;

/// How long teardown waits for the worker to exit on its own
const EXIT_GRACE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────
// Worker Command
// ─────────────────────────────────────────────────────────────────

/// Child process speaking the worker protocol on stdio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// This binary's own `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe.to_string_lossy().into_owned()).arg("worker"))
    }
}

impl std::fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// Channel pair connected to one worker
pub struct WorkerTransport {
    requests: mpsc::Sender<WorkerRequest>,
    messages: mpsc::Receiver<WorkerMessage>,
    guard: TransportGuard,
}

impl WorkerTransport {
    /// Run the worker runtime on its own Tokio task
    pub fn in_process<R: PublishRunner>(runner: R) -> Self {
        let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let runtime = WorkerRuntime::new(runner);
        let task = tokio::spawn(runtime.serve(req_rx, msg_tx));

        Self {
            requests: req_tx,
            messages: msg_rx,
            guard: TransportGuard {
                child: None,
                tasks: vec![task],
            },
        }
    }

    /// Spawn a child process and talk to it over stdio
    pub fn spawn(command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::WorkerSpawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::WorkerSpawn {
                command: command.to_string(),
                message: "stdio pipes unavailable".to_string(),
            });
        };

        info!(command = %command, pid = child.id(), "Worker process spawned");

        let mut transport = Self::from_io(stdout, stdin);
        transport.guard.child = Some(child);
        Ok(transport)
    }

    /// Speak the line protocol over an arbitrary byte stream pair
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let writer_task = tokio::spawn(write_lines(writer, req_rx));
        let reader_task = tokio::spawn(read_lines(reader, msg_tx));

        Self {
            requests: req_tx,
            messages: msg_rx,
            guard: TransportGuard {
                child: None,
                tasks: vec![writer_task, reader_task],
            },
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::Sender<WorkerRequest>, mpsc::Receiver<WorkerMessage>, TransportGuard) {
        (self.requests, self.messages, self.guard)
    }
}

/// Resources released when the transport is torn down
pub(crate) struct TransportGuard {
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportGuard {
    /// Wait briefly for a clean exit, then force it
    ///
    /// The request sender must already be dropped so the worker sees EOF.
    pub(crate) async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "Worker process exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for worker process"),
                Err(_) => {
                    warn!("Worker process did not exit; killing");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill worker process");
                    }
                }
            }
        }

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(EXIT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Line Codec
// ─────────────────────────────────────────────────────────────────

/// Decode one JSON value per line until EOF or the receiver goes away
///
/// Blank lines are skipped; undecodable lines are logged and dropped.
pub async fn read_lines<T, R>(reader: R, tx: mpsc::Sender<T>)
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            debug!("Line reader receiver dropped");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line_len = line.len(), "Dropping undecodable line"),
                }
            }
            Ok(None) => {
                debug!("Line reader reached EOF");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Line reader failed");
                break;
            }
        }
    }
}

/// Encode each received value as one JSON line until the channel closes
pub async fn write_lines<T, W>(mut writer: W, mut rx: mpsc::Receiver<T>)
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_string(&frame) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Line writer failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Line writer flush failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
