//! Driver trait definitions
//!
//! [`Executor`] is the callback surface a driver delivers node agent events
//! to. [`ExecutorDriver`] is what an executor may call back into. The two
//! are kept apart so the executor core can be driven by a fake in tests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ExecutorInfo, FrameworkInfo, NodeInfo, TaskId, TaskInfo, TaskStatus};

/// Shared handle passed to every callback
pub type DriverHandle = Arc<dyn ExecutorDriver>;

// ─────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────

/// Calls an executor makes into its driver
#[async_trait]
pub trait ExecutorDriver: Send + Sync {
    /// Send a task status update to the node agent.
    ///
    /// Resolves once the update has been handed to the transport. There is
    /// no retry: an error means the update is lost.
    async fn send_status_update(&self, status: TaskStatus) -> Result<()>;

    /// Send an opaque message to the framework scheduler
    async fn send_framework_message(&self, data: String) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────

/// Lifecycle callbacks delivered by a driver.
///
/// Callbacks never return errors; implementations log and carry on.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The executor attached to the node agent for the first time
    async fn registered(
        &self,
        driver: &DriverHandle,
        executor_info: &ExecutorInfo,
        framework_info: &FrameworkInfo,
        node_info: &NodeInfo,
    );

    /// The executor attached again after a reconnect
    async fn reregistered(&self, driver: &DriverHandle, node_info: &NodeInfo);

    /// The control channel dropped
    async fn disconnected(&self, driver: &DriverHandle);

    /// Run a task. Returns once the task has reached a terminal state.
    async fn launch_task(&self, driver: &DriverHandle, task: TaskInfo);

    /// Stop a running task
    async fn kill_task(&self, driver: &DriverHandle, task_id: &TaskId);

    /// Opaque message from the framework scheduler
    async fn framework_message(&self, driver: &DriverHandle, message: &str);

    /// The node agent wants the executor gone
    async fn shutdown(&self, driver: &DriverHandle);

    /// The driver or agent reported an error
    async fn error(&self, driver: &DriverHandle, message: &str);

    /// Tasks accepted but not yet reported terminal
    fn active_tasks(&self) -> Vec<TaskId> {
        Vec::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Driver Lifecycle
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    NotStarted,
    Running,
    Stopped,
    Aborted,
}

impl DriverStatus {
    /// Whether `join` should return
    pub fn is_finished(&self) -> bool {
        matches!(self, DriverStatus::Stopped | DriverStatus::Aborted)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverStatus::NotStarted => "not started",
            DriverStatus::Running => "running",
            DriverStatus::Stopped => "stopped",
            DriverStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a driver delivers `launch_task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Await every callback in order; a running task blocks later callbacks
    Serial,
    /// Run each `launch_task` on its own tokio task
    #[default]
    Concurrent,
}

impl FromStr for DispatchPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "serial" => Ok(DispatchPolicy::Serial),
            "concurrent" => Ok(DispatchPolicy::Concurrent),
            other => Err(Error::config_field_invalid(
                "executor.dispatch",
                format!("unknown dispatch policy '{}', expected serial or concurrent", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_status_finished() {
        assert!(!DriverStatus::NotStarted.is_finished());
        assert!(!DriverStatus::Running.is_finished());
        assert!(DriverStatus::Stopped.is_finished());
        assert!(DriverStatus::Aborted.is_finished());
    }

    #[test]
    fn test_dispatch_policy_parse() {
        assert_eq!("serial".parse::<DispatchPolicy>().unwrap(), DispatchPolicy::Serial);
        assert_eq!("Concurrent".parse::<DispatchPolicy>().unwrap(), DispatchPolicy::Concurrent);
        assert!("parallel".parse::<DispatchPolicy>().is_err());
        assert_eq!(DispatchPolicy::default(), DispatchPolicy::Concurrent);
    }
}
