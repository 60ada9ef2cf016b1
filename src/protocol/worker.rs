//! Worker RPC protocol
//!
//! Requests carry a unique `taskId`; every request gets exactly one terminal
//! `result` with the same `taskId`. `ready` follows a successful `init`, and
//! `log` messages are uncorrelated diagnostics that may appear at any time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────
// Requests (Supervisor → Worker)
// ─────────────────────────────────────────────────────────────────

/// A correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation identifier, echoed by the terminal response
    #[serde(rename = "taskId")]
    pub task_id: String,

    /// Kind-specific body
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Request kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RequestBody {
    /// Configure the runner; answered by `ready` and a `result`
    Init {
        #[serde(default)]
        config: Value,
    },

    /// Liveness probe; must not touch the external system
    Healthcheck {},

    /// Execute one publish run
    PublishRun { payload: Value },

    /// Acknowledge termination intent
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RequestBody {
    /// Get the wire kind name
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::Init { .. } => RequestKind::Init,
            RequestBody::Healthcheck {} => RequestKind::Healthcheck,
            RequestBody::PublishRun { .. } => RequestKind::PublishRun,
            RequestBody::Shutdown { .. } => RequestKind::Shutdown,
        }
    }
}

/// Request kind discriminator, used for logging and tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Init,
    Healthcheck,
    PublishRun,
    Shutdown,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Init => "init",
            RequestKind::Healthcheck => "healthcheck",
            RequestKind::PublishRun => "publishRun",
            RequestKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkerRequest {
    pub fn new(task_id: impl Into<String>, body: RequestBody) -> Self {
        Self {
            task_id: task_id.into(),
            body,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }
}

// ─────────────────────────────────────────────────────────────────
// Messages (Worker → Supervisor)
// ─────────────────────────────────────────────────────────────────

/// Severity of a worker log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Normalized failure shape
///
/// `retryable` is the worker's own hint about resubmission; the supervisor
/// never infers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl WorkerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(ref code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Terminal response for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "taskId")]
    pub task_id: String,

    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerFailure>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: WorkerFailure) -> Self {
        Self {
            task_id: task_id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into exactly one of value or failure
    pub fn into_outcome(self) -> std::result::Result<Value, WorkerFailure> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| WorkerFailure::new("worker reported failure without details")))
        }
    }
}

/// All messages a worker may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Emitted once after a successful `init`
    Ready {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "workerId")]
        worker_id: String,
        version: String,
    },

    /// Terminal response
    Result(TaskResult),

    /// Uncorrelated diagnostic
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl WorkerMessage {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        WorkerMessage::Log {
            level,
            message: message.into(),
            meta: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WorkerMessage::Ready { .. } => "ready",
            WorkerMessage::Result(_) => "result",
            WorkerMessage::Log { .. } => "log",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Typed results
// ─────────────────────────────────────────────────────────────────

/// Identity announced by `ready`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub version: String,
}

/// Healthcheck status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

/// Healthcheck result payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl HealthReport {
    pub fn ok(details: Value) -> Self {
        Self {
            status: HealthStatus::Ok,
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn error(details: Value) -> Self {
        Self {
            status: HealthStatus::Error,
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Receipt returned by a successful `publishRun`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub run_id: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

/// Acknowledgement returned by `shutdown`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownAck {
    pub acknowledged: bool,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
