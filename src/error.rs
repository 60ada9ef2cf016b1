//! Error types for syncdeck
//!
//! Every local failure carries a stable `E###` code. The hundreds digit is the
//! category and doubles as the process exit code (`E3xx` exits with 30).
//!
//! Worker task failures are *not* represented here: they travel as data
//! (`WorkerFailure`) across the RPC boundary and only become an [`Error`] when
//! a caller awaits them.

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::WorkerFailure;

/// Result type alias for syncdeck operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric codes; the hundreds digit is the category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // 1xx configuration
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // 2xx filesystem
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // 3xx server connection
    ConnectionFailed = 300,
    ConnectionTimeout = 301,

    // 4xx wire protocol
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,

    // 5xx state mirror
    PatchPath = 500,

    // 6xx worker supervision
    WorkerSpawn = 600,
    WorkerNotReady = 601,
    WorkerTimeout = 602,
    WorkerTransportClosed = 603,
    WorkerFailed = 604,

    // 9xx bugs and environment
    InternalError = 900,
}

impl ErrorCode {
    /// `E` followed by the number, e.g. `E603`
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Category digit times ten
    pub fn exit_code(&self) -> i32 {
        (*self as u16 / 100) as i32 * 10
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration file {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// A value parsed but is out of range; `field` is the dotted key
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // Filesystem
    // ─────────────────────────────────────────────────────────────

    #[error("Cannot read {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot render TOML: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("Cannot encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Server Connection
    // ─────────────────────────────────────────────────────────────

    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    // ─────────────────────────────────────────────────────────────
    // Wire Protocol
    // ─────────────────────────────────────────────────────────────

    /// Not JSON, or JSON missing required fields
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Well-formed message that is not valid at this point
    #[error("Unexpected protocol message: {message}")]
    ProtocolUnexpected { message: String },

    // ─────────────────────────────────────────────────────────────
    // State Mirror
    // ─────────────────────────────────────────────────────────────

    #[error("Patch path {path} is not reachable: {reason}")]
    PatchPath { path: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Worker Supervision
    // ─────────────────────────────────────────────────────────────

    #[error("Failed to spawn worker '{command}': {message}")]
    WorkerSpawn { command: String, message: String },

    /// A task was submitted before the worker announced `ready`
    #[error("Worker is not ready; call init first")]
    WorkerNotReady,

    /// Caller-side timeout; the worker may still finish the task
    #[error("Worker did not answer {kind} within {timeout_ms}ms")]
    WorkerTimeout { kind: String, timeout_ms: u64 },

    #[error("Worker transport closed: {reason}")]
    WorkerTransportClosed { reason: String },

    /// The worker answered `ok: false`
    #[error("Worker task failed: {0}")]
    WorkerFailed(WorkerFailure),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } | Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) if e.kind() == ErrorKind::NotFound => ErrorCode::IoNotFound,
            Error::Io(e) if e.kind() == ErrorKind::PermissionDenied => ErrorCode::IoPermission,
            Error::Io(_) => ErrorCode::IoRead,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,

            Error::ProtocolMalformed { .. } | Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,

            Error::PatchPath { .. } => ErrorCode::PatchPath,

            Error::WorkerSpawn { .. } => ErrorCode::WorkerSpawn,
            Error::WorkerNotReady => ErrorCode::WorkerNotReady,
            Error::WorkerTimeout { .. } => ErrorCode::WorkerTimeout,
            Error::WorkerTransportClosed { .. } => ErrorCode::WorkerTransportClosed,
            Error::WorkerFailed(_) => ErrorCode::WorkerFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether repeating the same operation may succeed
    ///
    /// For `WorkerFailed` this relays the worker's own hint; nothing is inferred.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::WorkerFailed(failure) => failure.retryable.unwrap_or(false),
            Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout { .. }
            | Error::WorkerTimeout { .. }
            | Error::WorkerTransportClosed { .. }
            | Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// What the operator can do about it, when there is something
    pub fn suggestion(&self) -> Option<&'static str> {
        let hint = match self {
            Error::ConfigNotFound { .. } => "Run 'syncdeck config init' to create a default configuration file.",
            Error::ConfigParse { .. } => "Fix the TOML syntax, then run 'syncdeck config validate'.",
            Error::ConfigValidation { .. } => "Correct the named setting in the configuration file or environment.",
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => {
                "Check that the server is running and that client.url points at its WebSocket endpoint."
            }
            Error::WorkerSpawn { .. } => "Set worker.command to an executable that speaks the worker protocol.",
            Error::WorkerNotReady => "Call init and wait for the worker to announce ready.",
            Error::WorkerTransportClosed { .. } => {
                "The worker exited or crashed; outstanding tasks were failed and may be resubmitted."
            }
            _ => return None,
        };
        Some(hint)
    }

    /// Colored multi-line rendering for stderr
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31merror[{}]\x1b[0m: {}\n", self.code(), self);
        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("  \x1b[33mhint\x1b[0m: {}\n", hint));
        }
        output
    }

    /// Single uncolored line for log files
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Validation failure attributed to one dotted key, e.g. `client.url`
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        Error::ConfigValidation {
            message: format!("{}: {}", field, message.into()),
            field: Some(field),
        }
    }

    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    pub fn patch_path(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::PatchPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transport_closed(reason: impl Into<String>) -> Self {
        Error::WorkerTransportClosed {
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
