//! Task lifecycle
//!
//! [`TaskExecutor`] is the executor core: it implements the driver callback
//! surface, runs each launched task through a [`TaskRunner`] and reports
//! RUNNING followed by exactly one terminal status per accepted launch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument};

use super::runner::{run_with_timeout, TaskOutcome, TaskRunner};
use super::state::{LaunchRejection, TaskTracker};
use crate::driver::{DriverHandle, Executor};
use crate::error::{Error, Result};
use crate::types::{ExecutorInfo, FrameworkInfo, NodeInfo, TaskId, TaskInfo, TaskState, TaskStatus};

/// How long shutdown waits for cancelled tasks to report
const KILL_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// The executor core
pub struct TaskExecutor {
    runner: Arc<dyn TaskRunner>,
    tracker: Arc<TaskTracker>,
    task_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl TaskExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            tracker: Arc::new(TaskTracker::new()),
            task_timeout: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    /// Bound every task's execution (`None` disables)
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// How long shutdown lets in-flight tasks finish before killing them
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Accepted launches since startup
    pub fn tasks_launched(&self) -> u64 {
        self.tracker.tasks_launched()
    }

    /// Send a status update. Failures are logged, never returned.
    async fn report(&self, driver: &DriverHandle, status: TaskStatus) {
        let state = status.state;
        if let Err(e) = driver.send_status_update(status).await {
            warn!(state = %state, error = %e, "Failed to send status update");
        }
    }

    /// Run an admitted task and report its terminal status
    async fn run_admitted(
        &self,
        driver: &DriverHandle,
        task: TaskInfo,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        self.report(driver, TaskStatus::new(task.task_id.clone(), TaskState::Running))
            .await;
        self.tracker.mark_running(&task.task_id);

        let launched = self.tracker.record_launch();
        info!(tasks_launched = launched, runner = self.runner.name(), "Task running");

        let result =
            run_with_timeout(self.runner.as_ref(), &task.command, cancel, self.task_timeout).await;

        let status = terminal_status(&task.task_id, result);
        let terminal = status.state;
        info!(state = %terminal, message = ?status.message, "Task execution completed");

        self.report(driver, status).await;
        if let Some(done) = self.tracker.complete(&task.task_id, terminal) {
            if done.kill_requested && terminal != TaskState::Killed {
                info!(state = %terminal, "Task ended before the kill took effect");
            }
            info!(elapsed_ms = done.age().as_millis() as u64, "Task done");
        }
    }
}

/// Map an execution result to the status reported to the agent
fn terminal_status(task_id: &TaskId, result: Result<TaskOutcome>) -> TaskStatus {
    let status = |state| TaskStatus::new(task_id.clone(), state);

    match result {
        Ok(TaskOutcome::Succeeded) => status(TaskState::Finished),
        Ok(TaskOutcome::Failed { message, .. }) => status(TaskState::Failed).with_message(message),
        Ok(TaskOutcome::Cancelled) => status(TaskState::Killed).with_message("task killed"),
        Ok(TaskOutcome::TimedOut { after }) => {
            let err = Error::TaskTimeout {
                task_id: task_id.to_string(),
                timeout_secs: after.as_secs(),
            };
            status(TaskState::Failed).with_message(err.to_string())
        }
        Err(e) => status(TaskState::Failed).with_message(e.to_string()),
    }
}

#[async_trait]
impl Executor for TaskExecutor {
    async fn registered(
        &self,
        _driver: &DriverHandle,
        executor_info: &ExecutorInfo,
        framework_info: &FrameworkInfo,
        node_info: &NodeInfo,
    ) {
        info!(
            executor_id = %executor_info.executor_id,
            framework_id = %framework_info.framework_id,
            node_id = %node_info.node_id,
            "Registered on node {}",
            node_info.hostname
        );
        self.tracker.set_node(node_info.clone());
    }

    async fn reregistered(&self, _driver: &DriverHandle, node_info: &NodeInfo) {
        if let Some(previous) = self.tracker.node() {
            if previous.node_id != node_info.node_id {
                warn!(previous = %previous.node_id, "Node changed across reconnect");
            }
        }
        info!(
            node_id = %node_info.node_id,
            tasks_launched = self.tracker.tasks_launched(),
            "Re-registered on node {}",
            node_info.hostname
        );
        self.tracker.set_node(node_info.clone());
    }

    async fn disconnected(&self, _driver: &DriverHandle) {
        info!(active_tasks = self.tracker.active_count(), "Disconnected from node agent");
    }

    async fn launch_task(&self, driver: &DriverHandle, task: TaskInfo) {
        let span = info_span!("task", task_id = %task.task_id);
        async {
            info!(
                name = %task.name,
                command = %task.command,
                data_bytes = task.data.as_ref().map_or(0, String::len),
                "Launching task"
            );

            match self.tracker.admit(&task) {
                Ok(cancel) => self.run_admitted(driver, task, cancel).await,
                Err(LaunchRejection::AlreadyRunning) => {
                    warn!("Ignoring launch for a task that is already running");
                }
                Err(rejection) => {
                    warn!(reason = %rejection, "Rejecting task launch");
                    let status = TaskStatus::new(task.task_id.clone(), TaskState::Failed)
                        .with_message(rejection.to_string());
                    self.report(driver, status).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn kill_task(&self, _driver: &DriverHandle, task_id: &TaskId) {
        let state = self.tracker.state_of(task_id);
        if self.tracker.cancel(task_id) {
            info!(task_id = %task_id, state = ?state, "Kill requested, cancelling task");
        } else {
            warn!(task_id = %task_id, "Kill requested for unknown task");
        }
    }

    async fn framework_message(&self, _driver: &DriverHandle, message: &str) {
        info!(bytes = message.len(), "Received framework message: {}", message);
    }

    async fn shutdown(&self, _driver: &DriverHandle) {
        if !self.tracker.is_accepting() {
            debug!("Shutdown already in progress");
        }
        self.tracker.stop_accepting();

        let active = self.tracker.active_count();
        info!(
            active_tasks = active,
            grace_secs = self.shutdown_grace.as_secs(),
            "Shutdown requested"
        );

        if !self.tracker.wait_idle(self.shutdown_grace).await {
            let killed = self.tracker.cancel_all();
            warn!(tasks = ?killed, "Grace period expired, killing remaining tasks");

            if !self.tracker.wait_idle(KILL_REPORT_TIMEOUT).await {
                warn!(
                    tasks = ?self.tracker.active_task_ids(),
                    "Tasks did not report after being killed"
                );
            }
        }

        let snapshot = self.tracker.snapshot();
        info!(
            launched = snapshot.launched,
            finished = snapshot.finished,
            failed = snapshot.failed,
            killed = snapshot.killed,
            "Executor drained"
        );
    }

    async fn error(&self, _driver: &DriverHandle, message: &str) {
        warn!(error = %message, "Driver reported an error");
    }

    fn active_tasks(&self) -> Vec<TaskId> {
        self.tracker.active_task_ids()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
