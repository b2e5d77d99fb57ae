//! Task type definitions
//!
//! Describes the tasks a node agent hands to the executor and the status
//! records the executor reports back.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────
// Task Identity
// ─────────────────────────────────────────────────────────────────

/// Opaque task identifier assigned by the framework scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a task as understood by the node agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Accepted by the agent, not yet handed to the executor
    Staging,
    /// Handed to the executor, not yet running
    Starting,
    /// Executing
    Running,
    /// Completed successfully
    Finished,
    /// Completed unsuccessfully
    Failed,
    /// Stopped by a kill request
    Killed,
    /// Lost track of by the agent or executor
    Lost,
    /// Could not be launched because the description was invalid
    Error,
}

impl TaskState {
    /// Whether no further transitions follow this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
            TaskState::Error => "TASK_ERROR",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Description
// ─────────────────────────────────────────────────────────────────

/// The command a task runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Command line (shell mode) or program path (exec mode)
    pub value: String,

    /// Run `value` through the configured shell
    #[serde(default = "default_shell")]
    pub shell: bool,

    /// Program arguments, only used when `shell` is false
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Extra environment variables for the task process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_shell() -> bool {
    true
}

impl CommandInfo {
    /// A shell command line
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            shell: true,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

impl fmt::Display for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)?;
        if !self.shell {
            for arg in &self.arguments {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// A task handed to the executor by the node agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier
    pub task_id: TaskId,

    /// Human-readable task name
    pub name: String,

    /// What to run
    pub command: CommandInfo,

    /// Opaque scheduler-defined payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<String>, name: impl Into<String>, command: CommandInfo) -> Self {
        Self {
            task_id: TaskId::new(task_id),
            name: name.into(),
            command,
            data: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Status
// ─────────────────────────────────────────────────────────────────

/// A status update reported to the node agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task this update is for
    pub task_id: TaskId,

    /// New state
    pub state: TaskState,

    /// Free-text detail (exit code, error text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the executor observed the transition
    pub timestamp: DateTime<Utc>,

    /// Identifies this update for acknowledgement
    pub uuid: Uuid,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            message: None,
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
