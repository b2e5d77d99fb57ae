//! Task runners
//!
//! A [`TaskRunner`] turns a task's [`CommandInfo`] into an outcome. The
//! executor core only sees the trait; which runner is used is a
//! configuration choice.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::{RunnerKind, RunnerSettings};
use crate::error::{Error, Result};
use crate::types::CommandInfo;

// ─────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────

/// How a task's execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Command completed successfully
    Succeeded,
    /// Command ran and reported failure
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    /// Execution stopped because the task's cancellation token fired
    Cancelled,
    /// Execution exceeded the task timeout and was stopped
    TimedOut { after: Duration },
}

// ─────────────────────────────────────────────────────────────────
// Runner Trait
// ─────────────────────────────────────────────────────────────────

/// Executes task commands
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Run `command` to completion or until `cancel` fires.
    ///
    /// `Err` is reserved for failures to run at all (e.g. spawn errors);
    /// a command that ran and failed is `Ok(TaskOutcome::Failed { .. })`.
    async fn execute(&self, command: &CommandInfo, cancel: CancellationToken) -> Result<TaskOutcome>;
}

/// Run `command` with an optional upper bound on its duration.
///
/// When the bound is hit the runner's future is dropped, which stops
/// whatever it was running.
pub async fn run_with_timeout(
    runner: &dyn TaskRunner,
    command: &CommandInfo,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Result<TaskOutcome> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, runner.execute(command, cancel)).await {
            Ok(result) => result,
            Err(_) => Ok(TaskOutcome::TimedOut { after: limit }),
        },
        None => runner.execute(command, cancel).await,
    }
}

/// Build the runner selected in the configuration
pub fn runner_from_settings(settings: &RunnerSettings) -> Arc<dyn TaskRunner> {
    match settings.kind {
        RunnerKind::Shell => Arc::new(ShellRunner::new(
            settings.shell.clone(),
            settings.working_dir.as_ref().map(PathBuf::from),
        )),
        RunnerKind::Sleep => Arc::new(SleepRunner::new(Duration::from_secs(settings.sleep_secs))),
    }
}

// ─────────────────────────────────────────────────────────────────
// Sleep Runner
// ─────────────────────────────────────────────────────────────────

/// Ignores the command and waits a fixed interval.
///
/// Useful to exercise the status protocol against an agent without running
/// anything on the node.
#[derive(Debug, Clone)]
pub struct SleepRunner {
    duration: Duration,
}

impl SleepRunner {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl TaskRunner for SleepRunner {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn execute(&self, _command: &CommandInfo, cancel: CancellationToken) -> Result<TaskOutcome> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(TaskOutcome::Succeeded),
            _ = cancel.cancelled() => Ok(TaskOutcome::Cancelled),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shell Runner
// ─────────────────────────────────────────────────────────────────

/// Runs the command as a child process
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            working_dir,
        }
    }

    fn build_command(&self, command: &CommandInfo) -> Command {
        let mut cmd = if command.shell {
            let mut c = Command::new(&self.shell);
            c.arg("-c").arg(&command.value);
            c
        } else {
            let mut c = Command::new(&command.value);
            c.args(&command.arguments);
            c
        };

        cmd.envs(&command.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("/bin/sh", None)
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, command: &CommandInfo, cancel: CancellationToken) -> Result<TaskOutcome> {
        let mut child = self
            .build_command(command)
            .spawn()
            .map_err(|source| Error::SpawnFailed {
                command: command.to_string(),
                source,
            })?;

        debug!(pid = ?child.id(), "Task process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout").in_current_span());
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr").in_current_span());
        }

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        match exited {
            Some(status) => {
                let status = status?;
                debug!(status = %status, "Task process exited");
                if status.success() {
                    Ok(TaskOutcome::Succeeded)
                } else {
                    Ok(TaskOutcome::Failed {
                        exit_code: status.code(),
                        message: format!("command {}", status),
                    })
                }
            }
            None => {
                // Already-exited children make kill fail; the outcome is the same.
                let _ = child.kill().await;
                Ok(TaskOutcome::Cancelled)
            }
        }
    }
}

/// Log a child's output stream line by line
async fn forward_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream = name, "{}", line);
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_runner_completes() {
        let runner = SleepRunner::new(Duration::from_millis(10));
        let outcome = runner
            .execute(&CommandInfo::shell("ignored"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_sleep_runner_cancel() {
        let runner = SleepRunner::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let outcome = runner.execute(&CommandInfo::shell("ignored"), cancel).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let outcome = ShellRunner::default()
            .execute(&CommandInfo::shell("true"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code() {
        let outcome = ShellRunner::default()
            .execute(&CommandInfo::shell("exit 3"), CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            TaskOutcome::Failed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_runner_environment() {
        let mut command = CommandInfo::shell("test \"$TASK_GREETING\" = hello");
        command.environment = BTreeMap::from([("TASK_GREETING".to_string(), "hello".to_string())]);

        let outcome = ShellRunner::default()
            .execute(&command, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_shell_runner_exec_mode() {
        let command = CommandInfo {
            value: "/bin/sh".to_string(),
            shell: false,
            arguments: vec!["-c".to_string(), "exit 0".to_string()],
            environment: BTreeMap::new(),
        };

        let outcome = ShellRunner::default()
            .execute(&command, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_shell_runner_spawn_failure() {
        let command = CommandInfo {
            value: "/nonexistent/definitely-not-a-binary".to_string(),
            shell: false,
            arguments: vec![],
            environment: BTreeMap::new(),
        };

        let err = ShellRunner::default()
            .execute(&command, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_shell_runner_cancel_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = ShellRunner::default()
            .execute(&CommandInfo::shell("sleep 30"), cancel)
            .await
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_with_timeout() {
        let runner = SleepRunner::new(Duration::from_secs(30));
        let outcome = run_with_timeout(
            &runner,
            &CommandInfo::shell("ignored"),
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        assert_eq!(outcome, TaskOutcome::TimedOut { after: Duration::from_millis(20) });
    }

    #[test]
    fn test_runner_from_settings() {
        let mut settings = RunnerSettings::default();
        settings.kind = RunnerKind::Sleep;
        assert_eq!(runner_from_settings(&settings).name(), "sleep");

        settings.kind = RunnerKind::Shell;
        assert_eq!(runner_from_settings(&settings).name(), "shell");
    }
}
