//! Worker-side runtime
//!
//! Serves the worker protocol on behalf of a [`PublishRunner`]. Every request
//! runs on its own task under `catch_unwind`, so a panicking handler turns into
//! an `error` log plus an `ok: false` result for that request only, and the
//! worker keeps serving.
//!
//! Panics outside a handler (the line reader, the decoder, the serve loop) are
//! reported as `error` logs too. A stdio worker additionally installs a panic
//! hook, so a panic on any thread of the process reaches the supervisor.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::TaskTracker;
use super::transport::{read_lines, write_lines};
use crate::protocol::{
    HealthReport, LogLevel, PublishReceipt, RequestBody, ShutdownAck, TaskResult, WorkerFailure,
    WorkerMessage, WorkerRequest, PROTOCOL_VERSION,
};

/// Outcome of a runner call
pub type RunnerResult<T> = std::result::Result<T, WorkerFailure>;

/// Failure codes produced by the runtime itself
pub mod codes {
    pub const NOT_READY: &str = "NOT_READY";
    pub const DUPLICATE_TASK: &str = "DUPLICATE_TASK";
    pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";
    pub const WORKER_PANIC: &str = "WORKER_PANIC";
    pub const ENCODE_FAILED: &str = "ENCODE_FAILED";
}

/// Finished task records kept for inspection
pub const DEFAULT_RETAINED_TASKS: usize = 100;

// ─────────────────────────────────────────────────────────────────
// Runner Trait
// ─────────────────────────────────────────────────────────────────

/// The external publishing backend
#[async_trait]
pub trait PublishRunner: Send + Sync + 'static {
    /// Apply configuration; `ready` is announced only if this succeeds
    async fn init(&self, config: Value) -> RunnerResult<()>;

    /// Cheap liveness probe; must not touch the external system
    async fn healthcheck(&self) -> RunnerResult<HealthReport>;

    /// Execute one publish run
    async fn publish_run(&self, payload: Value, log: &LogSink) -> RunnerResult<PublishReceipt>;

    /// Release resources before exit
    async fn shutdown(&self, _reason: Option<String>) -> RunnerResult<()> {
        Ok(())
    }
}

/// Best-effort diagnostic channel back to the supervisor
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<WorkerMessage>,
}

impl LogSink {
    pub fn for_channel(tx: mpsc::Sender<WorkerMessage>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, level: LogLevel, message: impl Into<String>, meta: Option<Value>) {
        let message = WorkerMessage::Log {
            level,
            message: message.into(),
            meta,
        };
        if self.tx.try_send(message).is_err() {
            debug!("Worker log dropped");
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message, None);
    }
}

// ─────────────────────────────────────────────────────────────────
// Worker Runtime
// ─────────────────────────────────────────────────────────────────

/// Request loop for one worker
pub struct WorkerRuntime {
    runner: Arc<dyn PublishRunner>,
    worker_id: String,
    tracker: Arc<TaskTracker>,
    initialized: Arc<AtomicBool>,
    retained_tasks: usize,
}

impl WorkerRuntime {
    pub fn new<R: PublishRunner>(runner: R) -> Self {
        Self {
            runner: Arc::new(runner),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            tracker: Arc::new(TaskTracker::new()),
            initialized: Arc::new(AtomicBool::new(false)),
            retained_tasks: DEFAULT_RETAINED_TASKS,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// How many finished task records the tracker keeps
    pub fn with_retained_tasks(mut self, retained_tasks: usize) -> Self {
        self.retained_tasks = retained_tasks;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn tracker(&self) -> Arc<TaskTracker> {
        self.tracker.clone()
    }

    /// Handle requests until the channel closes or `shutdown` is acknowledged
    ///
    /// A `taskId` that is still in flight is ignored with a `warn` log; the
    /// original request keeps its single terminal result. Serving also ends
    /// when nobody is left to read the results.
    pub async fn serve(self, mut requests: mpsc::Receiver<WorkerRequest>, messages: mpsc::Sender<WorkerMessage>) {
        info!(worker_id = %self.worker_id, "Worker runtime started");
        let mut in_flight = JoinSet::new();

        loop {
            let request = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = messages.closed() => {
                    error!(worker_id = %self.worker_id, "Result channel closed; worker stops serving");
                    break;
                }
            };

            // Reap finished handlers without waiting
            while let Some(Some(joined)) = in_flight.join_next().now_or_never() {
                report_abnormal_exit("task handler", joined, &messages);
            }

            let ctx = self.context(&messages);
            let task_id = request.task_id.clone();
            let kind = request.kind();

            if !self.tracker.add_task(&task_id, kind) {
                warn!(task_id = %task_id, kind = %kind, "Duplicate taskId ignored");
                ctx.emit(WorkerMessage::Log {
                    level: LogLevel::Warn,
                    message: format!("{} request ignored: taskId '{}' is already in flight", kind, task_id),
                    meta: Some(json!({ "taskId": task_id, "code": codes::DUPLICATE_TASK })),
                })
                .await;
                continue;
            }

            if matches!(request.body, RequestBody::Shutdown { .. }) {
                info!(
                    task_id = %task_id,
                    in_flight = in_flight.len(),
                    "Shutdown requested; draining in-flight tasks"
                );
                while let Some(joined) = in_flight.join_next().await {
                    report_abnormal_exit("task handler", joined, &messages);
                }
                ctx.handle(request).await;
                break;
            }

            in_flight.spawn(ctx.handle(request));
        }

        while let Some(joined) = in_flight.join_next().await {
            report_abnormal_exit("task handler", joined, &messages);
        }
        self.tracker.cleanup_old_tasks(0);
        info!(worker_id = %self.worker_id, "Worker runtime stopped");
    }

    /// Serve newline-delimited JSON over a byte stream pair
    ///
    /// Requests that cannot be decoded but carry a `taskId` are answered with
    /// a `MALFORMED_REQUEST` failure.
    pub async fn serve_io<R, W>(self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        self.serve_io_with(reader, writer, msg_tx, msg_rx).await;
    }

    async fn serve_io_with<R, W>(
        self,
        reader: R,
        writer: W,
        msg_tx: mpsc::Sender<WorkerMessage>,
        msg_rx: mpsc::Receiver<WorkerMessage>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (raw_tx, raw_rx) = mpsc::channel::<Value>(64);

        let writer_task = tokio::spawn(write_lines(writer, msg_rx));
        let reader_task = tokio::spawn(read_lines(reader, raw_tx));
        let decoder_task = tokio::spawn(decode_requests(raw_rx, req_tx, msg_tx.clone()));

        let reader_abort = reader_task.abort_handle();
        let decoder_abort = decoder_task.abort_handle();
        let reader_watch = tokio::spawn(watch_helper("request reader", reader_task, msg_tx.clone()));
        let decoder_watch = tokio::spawn(watch_helper("request decoder", decoder_task, msg_tx.clone()));

        let loop_tx = msg_tx.clone();
        if let Err(panic) = AssertUnwindSafe(self.serve(req_rx, msg_tx)).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Worker serve loop panicked");
            let _ = loop_tx.try_send(WorkerMessage::log(
                LogLevel::Error,
                format!("worker serve loop panicked: {}", message),
            ));
        }
        drop(loop_tx);

        decoder_abort.abort();
        reader_abort.abort();
        let _ = decoder_watch.await;
        let _ = reader_watch.await;

        // Every sender is gone now, so the writer drains and exits
        if let Err(e) = writer_task.await {
            error!(error = %e, "Worker writer ended abnormally; results may have been lost");
        }
    }

    /// Serve on this process's stdin / stdout
    ///
    /// Owns the process, so it also installs the panic reporter.
    pub async fn serve_stdio(self) {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        install_panic_reporter(&msg_tx);
        self.serve_io_with(tokio::io::stdin(), tokio::io::stdout(), msg_tx, msg_rx)
            .await;
    }

    fn context(&self, messages: &mpsc::Sender<WorkerMessage>) -> TaskContext {
        TaskContext {
            runner: self.runner.clone(),
            worker_id: self.worker_id.clone(),
            tracker: self.tracker.clone(),
            initialized: self.initialized.clone(),
            messages: messages.clone(),
            retained_tasks: self.retained_tasks,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Request Handling
// ─────────────────────────────────────────────────────────────────

struct TaskContext {
    runner: Arc<dyn PublishRunner>,
    worker_id: String,
    tracker: Arc<TaskTracker>,
    initialized: Arc<AtomicBool>,
    messages: mpsc::Sender<WorkerMessage>,
    retained_tasks: usize,
}

impl TaskContext {
    /// Run one request already registered with the tracker
    async fn handle(self, request: WorkerRequest) {
        let task_id = request.task_id.clone();
        let kind = request.kind();

        self.tracker.mark_running(&task_id);
        debug!(task_id = %task_id, kind = %kind, "Handling request");

        let outcome = AssertUnwindSafe(self.execute(&task_id, request.body))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => {
                self.tracker.mark_completed(&task_id);
                TaskResult::success(&task_id, value)
            }
            Ok(Err(failure)) => {
                info!(task_id = %task_id, kind = %kind, error = %failure, "Task failed");
                self.tracker.mark_failed(&task_id, failure.to_string());
                TaskResult::failure(&task_id, failure)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task_id, kind = %kind, panic = %message, "Task handler panicked");

                self.emit(WorkerMessage::Log {
                    level: LogLevel::Error,
                    message: format!("{} handler panicked: {}", kind, message),
                    meta: Some(json!({ "taskId": task_id })),
                })
                .await;

                self.tracker.mark_failed(&task_id, message.clone());
                TaskResult::failure(
                    &task_id,
                    WorkerFailure::new(format!("task panicked: {}", message))
                        .with_code(codes::WORKER_PANIC)
                        .with_retryable(false),
                )
            }
        };

        self.tracker.cleanup_old_tasks(self.retained_tasks);
        self.emit(WorkerMessage::Result(result)).await;
    }

    async fn execute(&self, task_id: &str, body: RequestBody) -> RunnerResult<Value> {
        match body {
            RequestBody::Init { config } => {
                self.runner.init(config).await?;
                self.initialized.store(true, Ordering::SeqCst);

                let version = PROTOCOL_VERSION.to_string();
                info!(worker_id = %self.worker_id, %version, "Worker ready");
                self.emit(WorkerMessage::Ready {
                    task_id: task_id.to_string(),
                    worker_id: self.worker_id.clone(),
                    version: version.clone(),
                })
                .await;

                Ok(json!({ "workerId": self.worker_id, "version": version }))
            }
            RequestBody::Healthcheck {} => encode(&self.runner.healthcheck().await?),
            RequestBody::PublishRun { payload } => {
                if !self.initialized.load(Ordering::SeqCst) {
                    return Err(WorkerFailure::new("worker has not been initialized")
                        .with_code(codes::NOT_READY)
                        .with_retryable(true));
                }
                let sink = LogSink::for_channel(self.messages.clone());
                encode(&self.runner.publish_run(payload, &sink).await?)
            }
            RequestBody::Shutdown { reason } => {
                self.runner.shutdown(reason).await?;
                encode(&ShutdownAck { acknowledged: true })
            }
        }
    }

    async fn emit(&self, message: WorkerMessage) {
        if self.messages.send(message).await.is_err() {
            debug!("Supervisor channel closed; message dropped");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Fault Reporting
// ─────────────────────────────────────────────────────────────────

/// Forward every panic in this process to the supervisor as an `error` log
///
/// Chains to the previous hook. Contained handler panics are reported twice:
/// here with their location, and by the handler with their `taskId`. The hook
/// holds the channel weakly, so it never keeps the writer open.
pub fn install_panic_reporter(messages: &mpsc::Sender<WorkerMessage>) {
    let messages = messages.downgrade();
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let Some(messages) = messages.upgrade() else {
            previous(info);
            return;
        };
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();

        let _ = messages.try_send(WorkerMessage::Log {
            level: LogLevel::Error,
            message: format!("worker panicked at {}: {}", location, message),
            meta: Some(json!({ "location": location, "thread": thread })),
        });
        previous(info);
    }));
}

/// Await a helper task and report a panic as an `error` log
async fn watch_helper(name: &'static str, task: JoinHandle<()>, messages: mpsc::Sender<WorkerMessage>) {
    report_abnormal_exit(name, task.await, &messages);
}

fn report_abnormal_exit(name: &str, joined: Result<(), JoinError>, messages: &mpsc::Sender<WorkerMessage>) {
    let Err(e) = joined else {
        return;
    };
    if e.is_cancelled() {
        return;
    }

    let message = match e.try_into_panic() {
        Ok(panic) => panic_message(panic.as_ref()),
        Err(e) => e.to_string(),
    };
    error!(task = name, panic = %message, "Worker task ended abnormally");
    let _ = messages.try_send(WorkerMessage::log(
        LogLevel::Error,
        format!("{} panicked: {}", name, message),
    ));
}

/// Turn raw JSON lines into requests; undecodable ones with a `taskId` are
/// answered right away
async fn decode_requests(
    mut raw_rx: mpsc::Receiver<Value>,
    req_tx: mpsc::Sender<WorkerRequest>,
    reject_tx: mpsc::Sender<WorkerMessage>,
) {
    while let Some(raw) = raw_rx.recv().await {
        match serde_json::from_value::<WorkerRequest>(raw.clone()) {
            Ok(request) => {
                if req_tx.send(request).await.is_err() {
                    break;
                }
            }
            Err(e) => match raw.get("taskId").and_then(Value::as_str) {
                Some(task_id) => {
                    warn!(task_id, error = %e, "Rejecting malformed request");
                    let failure = WorkerFailure::new(format!("malformed request: {}", e))
                        .with_code(codes::MALFORMED_REQUEST)
                        .with_retryable(false);
                    let _ = reject_tx
                        .send(WorkerMessage::Result(TaskResult::failure(task_id, failure)))
                        .await;
                }
                None => warn!(error = %e, "Dropping request without taskId"),
            },
        }
    }
}

fn encode<T: Serialize>(value: &T) -> RunnerResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        WorkerFailure::new(format!("failed to encode result: {}", e))
            .with_code(codes::ENCODE_FAILED)
            .with_retryable(false)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
