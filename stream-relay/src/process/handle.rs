//! Owned handle to a running child process.
//!
//! The child itself lives in a waiter task (the same shape as a download
//! engine's process waiter): the handle only keeps the pid, a watch on the
//! exit status and a token that asks the waiter to kill the child.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long to wait for a force-killed process to be reaped.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Result of [`ProcessHandle::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process had already exited.
    AlreadyExited(ExitInfo),
    /// The process exited within the graceful window.
    Graceful(ExitInfo),
    /// The graceful window elapsed and the tree was killed.
    Forced(Option<ExitInfo>),
}

impl TerminationOutcome {
    pub fn was_forced(&self) -> bool {
        matches!(self, Self::Forced(_))
    }
}

/// Cheaply cloneable handle to a spawned child.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    label: Arc<str>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_token: CancellationToken,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("label", &self.label)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Take ownership of `child` and watch it from a background task.
    pub fn watch(mut child: Child, label: impl Into<Arc<str>>) -> Self {
        let label = label.into();
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();

        let token = kill_token.clone();
        let task_label = label.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(process = %task_label, error = %e, "Failed to kill process");
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    error!(process = %task_label, error = %e, "Error waiting for process");
                    ExitInfo::from_code(-1)
                }
            };
            debug!(process = %task_label, exit = %info, "Process exited");
            let _ = exit_tx.send(Some(info));
        });

        Self {
            pid,
            label,
            exit_rx,
            kill_token,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the process has already exited.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.try_exit().is_some()
    }

    /// Wait for the process to exit.
    ///
    /// Returns `None` only if the waiter task vanished without reporting.
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
    }

    /// Wait for the process to exit, giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait()).await.ok().flatten()
    }

    /// Stop the process and its descendants.
    ///
    /// Asks the tree to exit, waits up to `grace`, then kills it.
    pub async fn terminate(&self, grace: Duration) -> TerminationOutcome {
        if let Some(info) = self.try_exit() {
            return TerminationOutcome::AlreadyExited(info);
        }

        match self.pid {
            Some(pid) => {
                if let Err(e) = process_utils::terminate_tree(pid) {
                    debug!(process = %self.label, pid, error = %e, "Graceful signal failed");
                }
            }
            None => self.kill_token.cancel(),
        }

        if let Some(info) = self.wait_timeout(grace).await {
            return TerminationOutcome::Graceful(info);
        }

        warn!(
            process = %self.label,
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "Process did not exit in time, killing process tree"
        );
        if let Some(pid) = self.pid {
            if let Err(e) = process_utils::kill_tree(pid) {
                debug!(process = %self.label, pid, error = %e, "Kill signal failed");
            }
        }
        self.kill_token.cancel();

        TerminationOutcome::Forced(self.wait_timeout(FORCE_KILL_WAIT).await)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessHandle {
        let child = process_utils::tokio_group_command("sh")
            .args(["-c", script])
            .spawn()
            .unwrap();
        ProcessHandle::watch(child, "test")
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let handle = sh("exit 3");
        let info = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.code, Some(3));
        assert_eq!(info.to_string(), "code 3");
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let handle = sh("sleep 30");
        assert!(handle.try_exit().is_none());

        let outcome = handle.terminate(Duration::from_secs(5)).await;
        assert!(matches!(outcome, TerminationOutcome::Graceful(_)));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_term_is_ignored() {
        let handle = sh("trap '' TERM; while true; do sleep 1; done");
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = handle.terminate(Duration::from_millis(300)).await;
        assert!(outcome.was_forced());
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_after_exit() {
        let handle = sh("exit 0");
        handle.wait().await;
        let outcome = handle.terminate(Duration::from_secs(1)).await;
        assert_eq!(outcome, TerminationOutcome::AlreadyExited(ExitInfo::from_code(0)));
    }

    #[test]
    fn test_exit_info_display() {
        let signalled = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signalled.to_string(), "signal 9");
        assert!(!signalled.success());
        assert!(ExitInfo::from_code(0).success());
    }
}
