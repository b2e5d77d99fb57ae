//! Executor state tracking
//!
//! Process-wide counters plus the table of in-flight tasks and their
//! cancellation tokens. Everything here is safe to touch from concurrently
//! dispatched callbacks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::{NodeInfo, TaskId, TaskInfo, TaskState};

// ─────────────────────────────────────────────────────────────────
// Active Task
// ─────────────────────────────────────────────────────────────────

/// A task between launch and its terminal status
#[derive(Debug)]
pub struct ActiveTask {
    pub task_id: TaskId,

    pub name: String,

    /// `Starting` until the RUNNING update has been attempted
    pub state: TaskState,

    pub received_at: Instant,

    /// Set once a kill has been requested
    pub kill_requested: bool,

    cancel: CancellationToken,
}

impl ActiveTask {
    fn new(task: &TaskInfo) -> Self {
        Self {
            task_id: task.task_id.clone(),
            name: task.name.clone(),
            state: TaskState::Starting,
            received_at: Instant::now(),
            kill_requested: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Time since the launch was accepted
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Why a launch was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRejection {
    /// Shutdown has begun
    ShuttingDown,
    /// A task with the same ID is still in flight
    AlreadyRunning,
}

impl fmt::Display for LaunchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchRejection::ShuttingDown => f.write_str("executor is shutting down"),
            LaunchRejection::AlreadyRunning => f.write_str("task is already running"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Tracker
// ─────────────────────────────────────────────────────────────────

/// Point-in-time copy of the tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub launched: u64,
    pub finished: u64,
    pub failed: u64,
    pub killed: u64,
    pub active: usize,
}

/// Process-wide executor state
pub struct TaskTracker {
    /// In-flight tasks by ID
    tasks: RwLock<HashMap<TaskId, ActiveTask>>,

    /// Accepted launches since startup
    launched: AtomicU64,

    finished: AtomicU64,
    failed: AtomicU64,
    killed: AtomicU64,

    /// Cleared when shutdown begins
    accepting: AtomicBool,

    /// Node from the most recent (re)registration
    node: RwLock<Option<NodeInfo>>,

    /// Signalled whenever the in-flight table becomes empty
    idle: Notify,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            launched: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            killed: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            node: RwLock::new(None),
            idle: Notify::new(),
        }
    }

    /// Add a task to the in-flight table and hand out its cancellation token
    pub fn admit(&self, task: &TaskInfo) -> Result<CancellationToken, LaunchRejection> {
        let mut tasks = self.tasks.write();

        // Checked under the table lock so shutdown cannot miss a late admit.
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(LaunchRejection::ShuttingDown);
        }
        if tasks.contains_key(&task.task_id) {
            return Err(LaunchRejection::AlreadyRunning);
        }

        let active = ActiveTask::new(task);
        let token = active.cancel.clone();
        tasks.insert(task.task_id.clone(), active);
        Ok(token)
    }

    /// Record that a task's RUNNING update has been attempted
    pub fn mark_running(&self, task_id: &TaskId) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            task.state = TaskState::Running;
        }
    }

    /// Count an accepted launch, returning the new total
    pub fn record_launch(&self) -> u64 {
        self.launched.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remove a task after its terminal status and count the outcome
    pub fn complete(&self, task_id: &TaskId, terminal: TaskState) -> Option<ActiveTask> {
        debug_assert!(terminal.is_terminal(), "{} is not a terminal state", terminal);

        let (removed, now_idle) = {
            let mut tasks = self.tasks.write();
            let removed = tasks.remove(task_id);
            (removed, tasks.is_empty())
        };

        match terminal {
            TaskState::Finished => self.finished.fetch_add(1, Ordering::SeqCst),
            TaskState::Killed => self.killed.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };

        if now_idle {
            self.idle.notify_waiters();
        }
        removed
    }

    /// Fire a task's cancellation token. Returns false for unknown tasks.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.kill_requested = true;
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Fire every in-flight cancellation token
    pub fn cancel_all(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.write();
        tasks
            .values_mut()
            .map(|task| {
                task.kill_requested = true;
                task.cancel.cancel();
                task.task_id.clone()
            })
            .collect()
    }

    /// Stop admitting new tasks
    pub fn stop_accepting(&self) {
        let _tasks = self.tasks.write();
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Wait until no task is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.tasks.read().is_empty() {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.tasks.read().is_empty();
            }
        }
    }

    pub fn set_node(&self, node: NodeInfo) {
        *self.node.write() = Some(node);
    }

    pub fn node(&self) -> Option<NodeInfo> {
        self.node.read().clone()
    }

    /// Accepted launches since startup
    pub fn tasks_launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn active_task_ids(&self) -> Vec<TaskId> {
        self.tasks.read().keys().cloned().collect()
    }

    /// State of an in-flight task
    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.tasks.read().get(task_id).map(|t| t.state)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            launched: self.launched.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            killed: self.killed.load(Ordering::SeqCst),
            active: self.active_count(),
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::types::CommandInfo;

    fn make_task(task_id: &str) -> TaskInfo {
        TaskInfo::new(task_id, format!("{}-name", task_id), CommandInfo::shell("true"))
    }

    #[test]
    fn test_admit_lifecycle() {
        let tracker = TaskTracker::new();
        let task = make_task("t-1");

        tracker.admit(&task).unwrap();
        assert_eq!(tracker.state_of(&task.task_id), Some(TaskState::Starting));

        tracker.mark_running(&task.task_id);
        assert_eq!(tracker.state_of(&task.task_id), Some(TaskState::Running));

        let done = tracker.complete(&task.task_id, TaskState::Finished).unwrap();
        assert_eq!(done.name, "t-1-name");
        assert!(!done.kill_requested);
        assert_eq!(tracker.state_of(&task.task_id), None);
        assert_eq!(tracker.snapshot().finished, 1);
    }

    #[test]
    fn test_complete_returns_cancelled_entry() {
        let tracker = TaskTracker::new();
        let task = make_task("t-1");
        tracker.admit(&task).unwrap();
        tracker.cancel(&task.task_id);

        let done = tracker.complete(&task.task_id, TaskState::Killed).unwrap();
        assert!(done.kill_requested);
        assert!(done.age() < Duration::from_secs(5));
        assert!(tracker.complete(&task.task_id, TaskState::Killed).is_none());
        assert!(tracker.active_task_ids().is_empty());
    }

    #[test]
    fn test_admit_rejects_duplicate() {
        let tracker = TaskTracker::new();
        tracker.admit(&make_task("t-1")).unwrap();

        assert_eq!(
            tracker.admit(&make_task("t-1")).unwrap_err(),
            LaunchRejection::AlreadyRunning
        );
        assert!(tracker.admit(&make_task("t-2")).is_ok());
    }

    #[test]
    fn test_admit_rejects_after_shutdown() {
        let tracker = TaskTracker::new();
        tracker.stop_accepting();

        assert!(!tracker.is_accepting());
        assert_eq!(
            tracker.admit(&make_task("t-1")).unwrap_err(),
            LaunchRejection::ShuttingDown
        );
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_record_launch_counts() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.record_launch(), 1);
        assert_eq!(tracker.record_launch(), 2);
        assert_eq!(tracker.tasks_launched(), 2);
    }

    #[test]
    fn test_cancel_fires_token() {
        let tracker = TaskTracker::new();
        let task = make_task("t-1");
        let token = tracker.admit(&task).unwrap();

        assert!(tracker.cancel(&task.task_id));
        assert!(token.is_cancelled());
        assert!(!tracker.cancel(&TaskId::from("unknown")));
    }

    #[test]
    fn test_cancel_all() {
        let tracker = TaskTracker::new();
        let a = tracker.admit(&make_task("t-1")).unwrap();
        let b = tracker.admit(&make_task("t-2")).unwrap();

        let mut ids = tracker.cancel_all();
        ids.sort();

        assert_eq!(ids, vec![TaskId::from("t-1"), TaskId::from("t-2")]);
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn test_outcome_counters() {
        let tracker = TaskTracker::new();
        for (id, state) in [
            ("t-1", TaskState::Finished),
            ("t-2", TaskState::Failed),
            ("t-3", TaskState::Killed),
        ] {
            let task = make_task(id);
            tracker.admit(&task).unwrap();
            tracker.complete(&task.task_id, state);
        }

        let snapshot = tracker.snapshot();
        assert_eq!((snapshot.finished, snapshot.failed, snapshot.killed), (1, 1, 1));
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn test_wait_idle_when_empty() {
        let tracker = TaskTracker::new();
        assert!(tracker.wait_idle(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let tracker = TaskTracker::new();
        tracker.admit(&make_task("t-1")).unwrap();
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_completion() {
        let tracker = Arc::new(TaskTracker::new());
        let task = make_task("t-1");
        tracker.admit(&task).unwrap();

        let completer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete(&task.task_id, TaskState::Finished);
        });

        assert!(tracker.wait_idle(Duration::from_secs(5)).await);
    }
}
