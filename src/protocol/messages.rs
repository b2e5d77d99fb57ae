//! Protocol message definitions
//!
//! All message types exchanged between the executor and the node agent.
//! Messages are serialized as JSON with a type discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::types::{ExecutorInfo, FrameworkInfo, NodeInfo, TaskId, TaskInfo, TaskStatus};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version
    pub version: ProtocolVersion,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            payload,
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Executor → Agent ───────────────────────────────────────
    /// Executor registration request
    RegisterExecutor(RegisterExecutorRequest),

    /// Task status update
    StatusUpdate(StatusUpdateMessage),

    /// Opaque message for the framework scheduler
    ExecutorMessage(FrameworkMessageBody),

    /// Executor is going away
    ExecutorShutdown(ExecutorShutdownMessage),

    // ─── Agent → Executor ───────────────────────────────────────
    /// First successful registration
    Registered(RegisteredMessage),

    /// Registration after a reconnect
    Reregistered(ReregisteredMessage),

    /// Run a task
    LaunchTask(LaunchTaskMessage),

    /// Kill a running task
    KillTask(KillTaskMessage),

    /// Opaque message from the framework scheduler
    FrameworkMessage(FrameworkMessageBody),

    /// Stop the executor
    Shutdown(ShutdownRequest),

    /// Agent received a status update
    StatusUpdateAck(StatusUpdateAckMessage),

    /// Error reported by the agent
    Error(ErrorMessage),
}

impl Message {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RegisterExecutor(_) => "REGISTER_EXECUTOR",
            Message::StatusUpdate(_) => "STATUS_UPDATE",
            Message::ExecutorMessage(_) => "EXECUTOR_MESSAGE",
            Message::ExecutorShutdown(_) => "EXECUTOR_SHUTDOWN",
            Message::Registered(_) => "REGISTERED",
            Message::Reregistered(_) => "REREGISTERED",
            Message::LaunchTask(_) => "LAUNCH_TASK",
            Message::KillTask(_) => "KILL_TASK",
            Message::FrameworkMessage(_) => "FRAMEWORK_MESSAGE",
            Message::Shutdown(_) => "SHUTDOWN",
            Message::StatusUpdateAck(_) => "STATUS_UPDATE_ACK",
            Message::Error(_) => "ERROR",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Registration Messages
// ─────────────────────────────────────────────────────────────────

/// Executor registration request, sent after every (re)connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterExecutorRequest {
    /// Executor ID
    pub executor_id: String,

    /// Framework the executor was launched for
    #[serde(default)]
    pub framework_id: Option<String>,

    /// Human-readable executor name
    pub name: String,

    /// Executor software version
    pub executor_version: String,
}

/// Registration acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredMessage {
    pub executor_info: ExecutorInfo,

    pub framework_info: FrameworkInfo,

    pub node_info: NodeInfo,

    /// Agent's protocol version
    #[serde(default)]
    pub agent_version: ProtocolVersion,
}

/// Re-registration acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReregisteredMessage {
    pub node_info: NodeInfo,
}

// ─────────────────────────────────────────────────────────────────
// Task Messages
// ─────────────────────────────────────────────────────────────────

/// Task launch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTaskMessage {
    pub task: TaskInfo,
}

/// Task kill request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillTaskMessage {
    pub task_id: TaskId,

    #[serde(default)]
    pub reason: Option<String>,
}

/// Task status update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    pub executor_id: String,

    pub status: TaskStatus,
}

/// Acknowledgment of a status update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateAckMessage {
    pub task_id: TaskId,

    /// UUID of the acknowledged update
    pub uuid: Uuid,
}

// ─────────────────────────────────────────────────────────────────
// Control Messages
// ─────────────────────────────────────────────────────────────────

/// Framework message payload (both directions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkMessageBody {
    pub data: String,
}

/// Shutdown request from the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Executor shutdown notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorShutdownMessage {
    pub executor_id: String,

    pub reason: String,

    /// Tasks still in flight when the executor stopped
    #[serde(default)]
    pub abandoned_tasks: Vec<TaskId>,
}

/// Error message from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Related message ID (if this is in response to a specific message)
    #[serde(default)]
    pub related_message_id: Option<Uuid>,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
