//! Error types for the node executor
//!
//! Every failure carries a stable code (`E100`, `E305`, ...) whose hundreds
//! digit names the area it came from. The area also decides the process
//! exit code and whether the driver may retry.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

// ─────────────────────────────────────────────────────────────────
// Codes
// ─────────────────────────────────────────────────────────────────

/// Area an error originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorArea {
    Config,
    File,
    AgentLink,
    Protocol,
    Task,
    Driver,
    Internal,
}

impl ErrorArea {
    /// Process exit code for errors from this area
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorArea::Config => 10,
            ErrorArea::File => 20,
            ErrorArea::AgentLink => 30,
            ErrorArea::Protocol => 40,
            ErrorArea::Task => 50,
            ErrorArea::Driver => 60,
            ErrorArea::Internal => 90,
        }
    }
}

/// Stable numeric error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ConfigMissing = 100,
    ConfigSyntax = 101,
    ConfigInvalid = 102,

    FileRead = 200,
    FileWrite = 201,
    FilePermission = 202,
    FileMissing = 203,

    AgentUnreachable = 300,
    AgentTimeout = 301,
    AgentLinkLost = 303,
    AgentOffline = 305,

    ProtocolMismatch = 400,
    ProtocolDecode = 401,

    TaskTimedOut = 501,
    TaskSpawn = 504,

    DriverLifecycle = 600,

    Internal = 900,
}

impl ErrorCode {
    pub fn area(self) -> ErrorArea {
        match self as u16 / 100 {
            1 => ErrorArea::Config,
            2 => ErrorArea::File,
            3 => ErrorArea::AgentLink,
            4 => ErrorArea::Protocol,
            5 => ErrorArea::Task,
            6 => ErrorArea::Driver,
            _ => ErrorArea::Internal,
        }
    }

    pub fn exit_code(self) -> i32 {
        self.area().exit_code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum Error {
    // ─── Configuration ──────────────────────────────────────────
    #[error("Configuration file not found: {}", .path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Could not parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    #[error("Invalid {}: {message}", .field.as_deref().unwrap_or("configuration"))]
    ConfigValidation { message: String, field: Option<String> },

    #[error("{0}")]
    Config(String),

    // ─── Files ──────────────────────────────────────────────────
    #[error("Could not read {}", .path.display())]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not write {}", .path.display())]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render configuration: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─── Node agent link ────────────────────────────────────────
    #[error("WebSocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Node agent at {url} unreachable: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("No answer from node agent at {url} within {timeout_secs}s")]
    ConnectionTimeout { url: String, timeout_secs: u64 },

    #[error("Lost connection to node agent: {message}")]
    ConnectionLost { message: String },

    /// Raised by outbound sends between connections
    #[error("Not connected to node agent")]
    NotConnected,

    // ─── Protocol ───────────────────────────────────────────────
    #[error("Node agent speaks protocol {actual}, this executor speaks {expected}")]
    ProtocolVersion { expected: String, actual: String },

    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    // ─── Tasks ──────────────────────────────────────────────────
    #[error("Task {task_id} timed out after {timeout_secs}s")]
    TaskTimeout { task_id: String, timeout_secs: u64 },

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // ─── Driver ─────────────────────────────────────────────────
    /// Lifecycle call made in the wrong driver state
    #[error("Driver is {state}, cannot {action}")]
    DriverState { state: String, action: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigMissing,
            Error::ConfigParse { .. } => ErrorCode::ConfigSyntax,
            Error::ConfigValidation { .. } | Error::Config(_) => ErrorCode::ConfigInvalid,

            Error::IoRead { .. } => ErrorCode::FileRead,
            Error::IoWrite { .. } => ErrorCode::FileWrite,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::FileMissing,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::FilePermission
            }
            Error::Io(_) => ErrorCode::FileRead,
            Error::Toml(_) => ErrorCode::ConfigSyntax,

            Error::WebSocket(_) | Error::ConnectionFailed { .. } => ErrorCode::AgentUnreachable,
            Error::ConnectionTimeout { .. } => ErrorCode::AgentTimeout,
            Error::ConnectionLost { .. } => ErrorCode::AgentLinkLost,
            Error::NotConnected => ErrorCode::AgentOffline,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolMismatch,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolDecode,

            Error::TaskTimeout { .. } => ErrorCode::TaskTimedOut,
            Error::SpawnFailed { .. } => ErrorCode::TaskSpawn,

            Error::DriverState { .. } => ErrorCode::DriverLifecycle,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Errors that end the driver instead of triggering a reconnect
    pub fn is_fatal(&self) -> bool {
        match self.code().area() {
            ErrorArea::Config | ErrorArea::Internal => true,
            ErrorArea::Protocol => !matches!(self, Error::ProtocolMalformed { .. }),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// What the operator can do about it
    pub fn suggestion(&self) -> Option<&'static str> {
        let hint = match self {
            Error::ConfigNotFound { .. } => {
                "Run 'node-executor config init' to create a default configuration file."
            }
            Error::ConfigParse { .. } => {
                "Check the TOML syntax. 'node-executor config validate' reports the exact location."
            }
            Error::ConfigValidation { .. } | Error::Config(_) => {
                "Fix the value named above, or override it with the matching NODE_EXECUTOR_* variable."
            }
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => {
                "Check that the node agent is running and that agent.url points at it."
            }
            Error::ConnectionLost { .. } | Error::NotConnected => {
                "The driver reconnects automatically; status updates sent meanwhile are lost."
            }
            Error::ProtocolVersion { .. } => {
                "Upgrade the executor or the node agent so their protocol major versions match."
            }
            Error::SpawnFailed { .. } => "Check runner.shell and runner.working_dir.",
            _ => return None,
        };
        Some(hint)
    }

    /// Colored multi-line rendering for stderr
    pub fn format_for_terminal(&self) -> String {
        let mut out = format!("\x1b[1;31merror[{}]\x1b[0m: {}\n", self.code(), self);
        if let Some(hint) = self.suggestion() {
            out.push_str(&format!("  \x1b[33mhint\x1b[0m: {}\n", hint));
        }
        out
    }

    /// Single-line rendering for log fields
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

    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn driver_state(state: impl fmt::Display, action: impl Into<String>) -> Self {
        Error::DriverState {
            state: state.to_string(),
            action: action.into(),
        }
    }
}
