//! Configuration system for syncdeck
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (SYNCDECK_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::supervisor::{SupervisorConfig, WorkerCommand};
use crate::sync::SessionConfig;

/// Valid values for `logging.level`
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server connection settings
    pub client: ClientSettings,

    /// Reconnection backoff
    pub reconnect: ReconnectSettings,

    /// State mirror behaviour
    pub sync: SyncSettings,

    /// Publish worker supervision
    pub worker: WorkerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Server WebSocket URL
    pub url: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Capabilities announced in `hello`
    pub capabilities: Vec<String>,

    /// Outbound messages buffered per connection
    pub message_queue_size: usize,
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Maximum consecutive failed attempts (0 = infinite)
    pub max_attempts: u32,
}

/// State mirror settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Re-request a snapshot when a version gap is detected
    pub resync_on_gap: bool,

    /// Log entries retained locally
    pub log_capacity: usize,

    /// Broadcast backlog per observer
    pub event_capacity: usize,
}

/// Worker supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker program (unset = this binary's `worker` subcommand)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to `command`
    pub args: Vec<String>,

    /// Run the worker on an in-process task instead of a child process
    pub in_process: bool,

    /// Seconds to wait for `ready` after `init` (0 = wait indefinitely)
    pub init_timeout_secs: u64,

    /// Seconds to wait for any other request (0 = wait indefinitely)
    pub request_timeout_secs: u64,

    /// Opaque runner configuration sent with `init`
    pub runner: toml::Table,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout_ms: 10_000,
            capabilities: vec!["state.patch".to_string(), "logs".to_string()],
            message_queue_size: 100,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 0, // Infinite
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            resync_on_gap: true,
            log_capacity: 1_000,
            event_capacity: 256,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: vec![],
            in_process: false,
            init_timeout_secs: 30,
            request_timeout_secs: 0,
            runner: toml::Table::new(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = match Self::find_config_file(config_path)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse one file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration file");
        let content = fs::read_to_string(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e.message()),
            source: Some(e),
        })?;
        info!(path = %path.display(), "Configuration loaded from file");
        Ok(config)
    }

    /// Find the configuration file to use
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // Explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::config_not_found(path))
            };
        }

        for path in Self::search_paths() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Standard locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("syncdeck.toml"), PathBuf::from("config.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("syncdeck").join("config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".syncdeck").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/syncdeck/config.toml"));
        paths
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Client settings
        if let Some(val) = env_var("URL") {
            self.client.url = val;
        }
        if let Some(n) = env_parse("CONNECT_TIMEOUT_MS") {
            self.client.connect_timeout_ms = n;
        }
        if let Some(val) = env_var("CAPABILITIES") {
            self.client.capabilities = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // Reconnect settings
        if let Some(n) = env_parse("RECONNECT_INITIAL_MS") {
            self.reconnect.initial_delay_ms = n;
        }
        if let Some(n) = env_parse("RECONNECT_MAX_MS") {
            self.reconnect.max_delay_ms = n;
        }
        if let Some(n) = env_parse("RECONNECT_MULTIPLIER") {
            self.reconnect.multiplier = n;
        }
        if let Some(n) = env_parse("RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = n;
        }

        // Sync settings
        if let Some(val) = env_var("RESYNC_ON_GAP") {
            self.sync.resync_on_gap = parse_bool(&val);
        }

        // Worker settings
        if let Some(val) = env_var("WORKER_COMMAND") {
            self.worker.command = Some(val);
        }
        if let Some(val) = env_var("WORKER_IN_PROCESS") {
            self.worker.in_process = parse_bool(&val);
        }
        if let Some(n) = env_parse("WORKER_INIT_TIMEOUT_SECS") {
            self.worker.init_timeout_secs = n;
        }

        // Logging settings
        if let Some(val) = env_var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = env_var("LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(val) = env_var("LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
    }

    /// Expand ~ and environment variables in paths
    pub fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
        if let Some(ref command) = self.worker.command {
            self.worker.command = Some(expand_path(command));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.client.url.trim();
        if url.is_empty() {
            return Err(Error::config_field_invalid("client.url", "URL cannot be empty"));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "client.url",
                format!("URL must start with ws:// or wss:// (got '{}')", url),
            ));
        }
        if url::Url::parse(url).is_err() {
            return Err(Error::config_field_invalid("client.url", format!("'{}' is not a valid URL", url)));
        }

        if self.client.capabilities.is_empty() {
            return Err(Error::config_field_invalid(
                "client.capabilities",
                "at least one capability must be announced",
            ));
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err(Error::config_field_invalid(
                "reconnect.initial_delay_ms",
                "initial delay must be greater than zero",
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::config_field_invalid(
                "reconnect.max_delay_ms",
                format!(
                    "max delay ({}ms) must not be below the initial delay ({}ms)",
                    self.reconnect.max_delay_ms, self.reconnect.initial_delay_ms
                ),
            ));
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(Error::config_field_invalid(
                "reconnect.multiplier",
                format!("multiplier must be at least 1.0 (got {})", self.reconnect.multiplier),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Connection manager settings derived from `[client]` and `[reconnect]`
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            max_reconnect_attempts: self.reconnect.max_attempts,
            initial_reconnect_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            multiplier: self.reconnect.multiplier,
            message_queue_size: self.client.message_queue_size,
        }
    }

    /// Session settings derived from `[client]` and `[sync]`
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capabilities: self.client.capabilities.clone(),
            resync_on_gap: self.sync.resync_on_gap,
            event_capacity: self.sync.event_capacity,
            log_capacity: self.sync.log_capacity,
        }
    }

    /// Supervisor settings derived from `[worker]`
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let secs = |n: u64| (n > 0).then(|| Duration::from_secs(n));
        SupervisorConfig {
            init_timeout: secs(self.worker.init_timeout_secs),
            request_timeout: secs(self.worker.request_timeout_secs),
            ..Default::default()
        }
    }

    /// Worker process to spawn
    pub fn worker_command(&self) -> Result<WorkerCommand> {
        match self.worker.command {
            Some(ref program) => Ok(WorkerCommand {
                program: program.clone(),
                args: self.worker.args.clone(),
            }),
            None => WorkerCommand::current_exe(),
        }
    }

    /// Runner configuration as the JSON sent with `init`
    pub fn runner_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.worker.runner).unwrap_or_default()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("SYNCDECK_{}", name)).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".syncdeck")
        .join("config.toml")
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# syncdeck configuration

[client]
# Server WebSocket URL
url = "ws://127.0.0.1:8080/ws"

# Connection timeout in milliseconds
connect_timeout_ms = 10000

# Capabilities announced in the hello message
capabilities = ["state.patch", "logs"]

# Outbound messages buffered per connection
message_queue_size = 100

[reconnect]
# Delay before the first retry in milliseconds
initial_delay_ms = 1000

# Upper bound on the retry delay in milliseconds
max_delay_ms = 30000

# Growth factor between consecutive delays
multiplier = 2.0

# Maximum consecutive failed attempts (0 = infinite)
max_attempts = 0

[sync]
# Re-request a snapshot when a patch arrives out of order
resync_on_gap = true

# Log entries retained locally
log_capacity = 1000

# Broadcast backlog per observer
event_capacity = 256

[worker]
# Worker program (defaults to this binary's `worker` subcommand)
# command = "/usr/local/bin/syncdeck"
# args = ["worker"]

# Run the worker on an in-process task instead of a child process
in_process = false

# Seconds to wait for ready after init (0 = wait indefinitely)
init_timeout_secs = 30

# Seconds to wait for any other request (0 = wait indefinitely)
request_timeout_secs = 0

# Opaque settings passed to the publishing backend with init
[worker.runner]
# target = "dashboard"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.syncdeck/logs/syncdeck.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
