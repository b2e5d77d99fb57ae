//! Configuration system for the node executor
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (NODE_EXECUTOR_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::DispatchPolicy;
use crate::error::{Error, Result};

/// Main executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Executor identity and lifecycle settings
    pub executor: ExecutorSettings,

    /// How task commands are run
    pub runner: RunnerSettings,

    /// Node agent connection settings
    pub agent: AgentSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Executor identity and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Unique executor identifier (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable executor name (hostname if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// How launch callbacks are dispatched: serial or concurrent
    pub dispatch: DispatchPolicy,

    /// Upper bound on a single task's execution in seconds (0 = none)
    pub task_timeout_secs: u64,

    /// How long shutdown waits for in-flight tasks before killing them
    pub shutdown_grace_secs: u64,
}

/// Task runner kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Run the task command in a subprocess
    #[default]
    Shell,
    /// Wait a fixed interval instead of running anything
    Sleep,
}

/// Task runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Runner kind: shell or sleep
    pub kind: RunnerKind,

    /// Wait interval for the sleep runner in seconds
    pub sleep_secs: u64,

    /// Shell used for shell-mode commands
    pub shell: String,

    /// Working directory for task processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Node agent connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Node agent WebSocket URL
    pub url: String,

    /// Framework this executor runs tasks for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Initial reconnection delay in milliseconds
    pub reconnect_interval_ms: u64,

    /// Maximum reconnection delay in milliseconds
    pub max_reconnect_delay_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
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

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            dispatch: DispatchPolicy::default(),
            task_timeout_secs: 0,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            kind: RunnerKind::default(),
            sleep_secs: 10,
            shell: "/bin/sh".to_string(),
            working_dir: None,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5051/executor".to_string(),
            framework_id: None,
            connect_timeout_ms: 10000,
            reconnect_interval_ms: 1000,
            max_reconnect_delay_ms: 30000,
            max_reconnect_attempts: 0, // Infinite
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Shell => "shell",
            RunnerKind::Sleep => "sleep",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shell" => Ok(RunnerKind::Shell),
            "sleep" => Ok(RunnerKind::Sleep),
            other => Err(Error::config_field_invalid(
                "runner.kind",
                format!("unknown runner '{}', expected shell or sleep", other),
            )),
        }
    }
}

impl ExecutorSettings {
    /// Task execution bound, `None` when disabled
    pub fn task_timeout(&self) -> Option<Duration> {
        match self.task_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Executor ID, empty until [`ExecutorConfig::load`] has filled it in
    pub fn executor_id(&self) -> String {
        self.id.clone().unwrap_or_default()
    }

    /// Executor name, falling back to the host name
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(default_name)
    }
}

impl ExecutorConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = Self::from_toml(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides()?;

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        // 5. Fill in generated identity
        config.resolve_identity();

        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.message().to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("node-executor.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("node-executor").join("executor.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".node-executor").join("executor.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/node-executor/executor.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // Executor settings
        if let Ok(val) = std::env::var("NODE_EXECUTOR_ID") {
            self.executor.id = Some(val);
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_NAME") {
            self.executor.name = Some(val);
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_DISPATCH") {
            self.executor.dispatch = val.parse()?;
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_TASK_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.executor.task_timeout_secs = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_SHUTDOWN_GRACE_SECS") {
            if let Ok(n) = val.parse() {
                self.executor.shutdown_grace_secs = n;
            }
        }

        // Runner settings
        if let Ok(val) = std::env::var("NODE_EXECUTOR_RUNNER") {
            self.runner.kind = val.parse()?;
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_SLEEP_SECS") {
            if let Ok(n) = val.parse() {
                self.runner.sleep_secs = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_SHELL") {
            self.runner.shell = val;
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_WORKING_DIR") {
            self.runner.working_dir = Some(val);
        }

        // Agent settings
        if let Ok(val) = std::env::var("NODE_EXECUTOR_AGENT_URL") {
            self.agent.url = val;
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_FRAMEWORK_ID") {
            self.agent.framework_id = Some(val);
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.agent.connect_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_RECONNECT_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.agent.reconnect_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_MAX_RECONNECT_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.agent.max_reconnect_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.agent.max_reconnect_attempts = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("NODE_EXECUTOR_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("NODE_EXECUTOR_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        Ok(())
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref dir) = self.runner.working_dir {
            self.runner.working_dir = Some(expand_path(dir));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if matches!(self.executor.id.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(Error::config_field_invalid("executor.id", "Executor ID cannot be empty"));
        }

        // Validate agent URL
        if self.agent.url.is_empty() {
            return Err(Error::config_field_invalid("agent.url", "Agent URL cannot be empty"));
        }
        if !self.agent.url.starts_with("ws://") && !self.agent.url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "agent.url",
                "Agent URL must start with ws:// or wss://",
            ));
        }
        if url::Url::parse(&self.agent.url).is_err() {
            return Err(Error::config_field_invalid(
                "agent.url",
                format!("Agent URL '{}' is not a valid URL", self.agent.url),
            ));
        }

        if self.agent.connect_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "agent.connect_timeout_ms",
                "connect_timeout_ms must be greater than zero",
            ));
        }

        if self.agent.max_reconnect_delay_ms < self.agent.reconnect_interval_ms {
            return Err(Error::config_field_invalid(
                "agent.max_reconnect_delay_ms",
                "max_reconnect_delay_ms must not be below reconnect_interval_ms",
            ));
        }

        if self.runner.kind == RunnerKind::Shell && self.runner.shell.trim().is_empty() {
            return Err(Error::config_field_invalid("runner.shell", "Shell cannot be empty"));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Generate an executor ID and name where none was configured
    fn resolve_identity(&mut self) {
        if self.executor.id.is_none() {
            let id = format!("executor-{}", Uuid::new_v4().simple());
            debug!(executor_id = %id, "Generated executor ID");
            self.executor.id = Some(id);
        }
        if self.executor.name.is_none() {
            self.executor.name = Some(default_name());
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.connect_timeout_ms)
    }
}

/// Host name, or the binary name when it cannot be read
fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node-executor".to_string())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".node-executor")
                .join("executor.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Node Executor Configuration

[executor]
# Unique executor identifier (auto-generated if not set)
# id = "executor-abc123"

# Human-readable executor name (host name if not set)
# name = "batch-executor"

# Launch dispatch: "concurrent" runs tasks side by side,
# "serial" runs one task at a time in arrival order
dispatch = "concurrent"

# Upper bound on a single task's execution in seconds (0 = none)
task_timeout_secs = 0

# Seconds shutdown waits for running tasks before killing them
shutdown_grace_secs = 30

[runner]
# Runner kind: "shell" runs the task command, "sleep" only waits
kind = "shell"

# Wait interval for the sleep runner in seconds
sleep_secs = 10

# Shell used for shell-mode commands
shell = "/bin/sh"

# Working directory for task processes
# working_dir = "/var/lib/node-executor/work"

[agent]
# Node agent WebSocket URL
url = "ws://127.0.0.1:5051/executor"

# Framework this executor runs tasks for
# framework_id = "framework-1"

# Connection timeout in milliseconds
connect_timeout_ms = 10000

# Initial reconnection delay in milliseconds
reconnect_interval_ms = 1000

# Maximum reconnection delay in milliseconds
max_reconnect_delay_ms = 30000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.node-executor/logs/executor.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
