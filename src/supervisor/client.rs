//! Worker supervisor
//!
//! Drives one worker over a [`WorkerTransport`]. Each request gets a fresh
//! UUID `taskId` and a pending `oneshot` slot; the reader task completes slots
//! as results arrive, in whatever order the worker answers. When the
//! transport ends, every outstanding request fails with a retryable
//! `TRANSPORT_CLOSED` failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::transport::{TransportGuard, WorkerTransport};
use crate::error::{Error, Result};
use crate::protocol::{
    HealthReport, LogLevel, ProtocolVersion, RequestBody, ShutdownAck, TaskResult, WorkerFailure,
    WorkerIdentity, WorkerMessage, WorkerRequest, PROTOCOL_VERSION,
};

/// Failure code for requests outstanding when the transport ends
pub const TRANSPORT_CLOSED: &str = "TRANSPORT_CLOSED";

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Supervisor timeouts and buffers
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Caller-side wait for `init` (None = wait indefinitely)
    pub init_timeout: Option<Duration>,

    /// Caller-side wait for every other request (None = wait indefinitely)
    pub request_timeout: Option<Duration>,

    /// Broadcast backlog for forwarded worker logs
    pub log_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            init_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
            log_capacity: 256,
        }
    }
}

/// A `log` message relayed from the worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLog {
    pub level: LogLevel,
    pub message: String,
    pub meta: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────
// Pending Requests
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<TaskResult>>,

    /// Set once the transport has ended; no new waiters are accepted
    closed: Option<String>,
}

struct Shared {
    pending: Mutex<Pending>,
    announced: Mutex<Option<WorkerIdentity>>,
    logs_tx: broadcast::Sender<WorkerLog>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────
// Worker Supervisor
// ─────────────────────────────────────────────────────────────────

/// Correlated request/response client for one worker
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    requests: mpsc::Sender<WorkerRequest>,
    shared: Arc<Shared>,
    ready: AtomicBool,
    reader: JoinHandle<()>,
    guard: TransportGuard,
}

impl WorkerSupervisor {
    /// Attach to a transport and start reading worker messages
    pub fn start(transport: WorkerTransport, config: SupervisorConfig) -> Self {
        let (requests, messages, guard) = transport.into_parts();
        let (logs_tx, _) = broadcast::channel(config.log_capacity.max(1));

        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            announced: Mutex::new(None),
            logs_tx,
        });

        let reader = tokio::spawn(run_reader(messages, shared.clone()));

        Self {
            config,
            requests,
            shared,
            ready: AtomicBool::new(false),
            reader,
            guard,
        }
    }

    /// Configure the worker and wait for it to announce `ready`
    pub async fn init(&self, config: Value) -> Result<WorkerIdentity> {
        let result = self
            .call(RequestBody::Init { config }, self.config.init_timeout)
            .await?;
        outcome(result)?;

        let identity = self.shared.announced.lock().clone().ok_or_else(|| Error::ProtocolUnexpected {
            message: "worker completed init without announcing ready".to_string(),
        })?;

        let version: ProtocolVersion = identity.version.parse().map_err(|e: String| Error::ProtocolMalformed {
            message: e,
        })?;
        if !PROTOCOL_VERSION.is_compatible_with(&version) {
            return Err(Error::ProtocolUnexpected {
                message: format!(
                    "worker speaks protocol {}, supervisor speaks {}",
                    version, PROTOCOL_VERSION
                ),
            });
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(worker_id = %identity.worker_id, version = %identity.version, "Worker ready");
        Ok(identity)
    }

    /// Probe worker liveness
    pub async fn healthcheck(&self) -> Result<HealthReport> {
        self.ensure_ready()?;
        let result = self
            .call(RequestBody::Healthcheck {}, self.config.request_timeout)
            .await?;
        decode(outcome(result)?)
    }

    /// Run one publish job; resolves with the worker's receipt
    pub async fn submit_task(&self, payload: Value) -> Result<Value> {
        self.ensure_ready()?;
        let result = self
            .call(RequestBody::PublishRun { payload }, self.config.request_timeout)
            .await?;
        outcome(result)
    }

    /// Ask the worker to stop, then tear the transport down
    pub async fn shutdown(self, reason: Option<String>) -> Result<ShutdownAck> {
        let result = self
            .call(RequestBody::Shutdown { reason }, self.config.request_timeout)
            .await;

        let Self {
            requests,
            reader,
            guard,
            ..
        } = self;

        // Closing the request channel lets the worker observe EOF
        drop(requests);
        guard.close().await;
        if tokio::time::timeout(Duration::from_secs(5), reader).await.is_err() {
            warn!("Worker reader did not finish after shutdown");
        }

        let ack: ShutdownAck = decode(outcome(result?)?)?;
        info!(acknowledged = ack.acknowledged, "Worker shut down");
        Ok(ack)
    }

    /// Whether `init` has completed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether the transport has ended
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Identity from the worker's `ready`, once announced
    pub fn identity(&self) -> Option<WorkerIdentity> {
        self.shared.announced.lock().clone()
    }

    /// Requests awaiting a terminal result
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().waiters.len()
    }

    /// Observe worker `log` messages
    pub fn subscribe_logs(&self) -> broadcast::Receiver<WorkerLog> {
        self.shared.logs_tx.subscribe()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::WorkerNotReady)
        }
    }

    /// Send one request and wait for its terminal result
    async fn call(&self, body: RequestBody, timeout: Option<Duration>) -> Result<TaskResult> {
        let task_id = Uuid::new_v4().to_string();
        let kind = body.kind();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock();
            if let Some(ref reason) = pending.closed {
                return Err(Error::transport_closed(reason.clone()));
            }
            pending.waiters.insert(task_id.clone(), tx);
        }

        debug!(task_id = %task_id, kind = %kind, "Sending worker request");

        if self
            .requests
            .send(WorkerRequest::new(task_id.clone(), body))
            .await
            .is_err()
        {
            self.shared.pending.lock().waiters.remove(&task_id);
            return Err(Error::transport_closed("worker request channel closed"));
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Abandon the slot; a late result is dropped by the reader
                    self.shared.pending.lock().waiters.remove(&task_id);
                    warn!(task_id = %task_id, kind = %kind, "Worker request timed out");
                    return Err(Error::WorkerTimeout {
                        kind: kind.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        received.map_err(|_| Error::transport_closed("response slot dropped"))
    }
}

/// Collapse a terminal result into value or error
fn outcome(result: TaskResult) -> Result<Value> {
    result.into_outcome().map_err(Error::WorkerFailed)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::ProtocolMalformed {
        message: format!("unexpected result shape: {}", e),
    })
}

// ─────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────

async fn run_reader(mut messages: mpsc::Receiver<WorkerMessage>, shared: Arc<Shared>) {
    while let Some(message) = messages.recv().await {
        match message {
            WorkerMessage::Ready {
                task_id,
                worker_id,
                version,
            } => {
                debug!(task_id = %task_id, worker_id = %worker_id, version = %version, "Worker announced ready");
                *shared.announced.lock() = Some(WorkerIdentity { worker_id, version });
            }
            WorkerMessage::Result(result) => {
                let waiter = shared.pending.lock().waiters.remove(&result.task_id);
                match waiter {
                    Some(tx) => {
                        // Receiver may have given up (timeout); nothing to do
                        let _ = tx.send(result);
                    }
                    None => debug!(task_id = %result.task_id, "Dropping result for unknown taskId"),
                }
            }
            WorkerMessage::Log {
                level,
                message,
                meta,
            } => {
                forward_log(level, &message, meta.as_ref());
                let _ = shared.logs_tx.send(WorkerLog {
                    level,
                    message,
                    meta,
                });
            }
        }
    }

    fail_outstanding(&shared, "worker transport closed");
}

fn forward_log(level: LogLevel, message: &str, meta: Option<&Value>) {
    let meta = meta.map(Value::to_string).unwrap_or_default();
    match level {
        LogLevel::Debug => debug!(target: "syncdeck::worker", meta = %meta, "{}", message),
        LogLevel::Info => info!(target: "syncdeck::worker", meta = %meta, "{}", message),
        LogLevel::Warn => warn!(target: "syncdeck::worker", meta = %meta, "{}", message),
        LogLevel::Error => error!(target: "syncdeck::worker", meta = %meta, "{}", message),
    }
}

fn fail_outstanding(shared: &Shared, reason: &str) {
    let waiters = {
        let mut pending = shared.pending.lock();
        pending.closed = Some(reason.to_string());
        std::mem::take(&mut pending.waiters)
    };

    if waiters.is_empty() {
        info!("Worker transport closed");
        return;
    }

    warn!(outstanding = waiters.len(), "Worker transport closed; failing outstanding requests");
    for (task_id, tx) in waiters {
        let failure = WorkerFailure::new(reason)
            .with_code(TRANSPORT_CLOSED)
            .with_retryable(true);
        let _ = tx.send(TaskResult::failure(task_id, failure));
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
