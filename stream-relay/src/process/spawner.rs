//! Spawning of supervised children.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::handle::ProcessHandle;
use super::records::RecordReader;

/// Lines buffered between the stderr reader and its consumer.
const DIAGNOSTIC_BUFFER: usize = 64;

/// Read errors in a row after which the stderr pipe is abandoned.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Diagnostic (stderr) lines of a child, closed when the stream hits EOF.
pub type DiagnosticStream = mpsc::Receiver<String>;

/// Everything needed to start a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Short name used in logs.
    pub label: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// A freshly started child.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub diagnostics: DiagnosticStream,
}

/// Starts OS processes.
///
/// Must be called from within a tokio runtime.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> std::io::Result<SpawnedProcess>;
}

/// Spawner backed by `tokio::process`.
///
/// Children get their own process group, a null stdin/stdout and a piped
/// stderr that is forwarded record by record (see [`RecordReader`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, spec: &CommandSpec) -> std::io::Result<SpawnedProcess> {
        let mut cmd = process_utils::tokio_group_command(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        debug!(process = %spec.label, pid = ?child.id(), "Spawned process");

        let (tx, rx) = mpsc::channel(DIAGNOSTIC_BUFFER);
        match child.stderr.take() {
            Some(stderr) => {
                tokio::spawn(forward_lines(stderr, tx, spec.label.clone()));
            }
            None => warn!(process = %spec.label, "Failed to capture stderr"),
        }

        Ok(SpawnedProcess {
            handle: ProcessHandle::watch(child, spec.label.as_str()),
            diagnostics: rx,
        })
    }
}

/// Forward diagnostic records until EOF.
///
/// Keeps reading after the consumer hangs up, and after read errors, so the
/// pipe stays open and the child never blocks or dies on a write.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(reader);
    let mut consumer_alive = true;
    let mut read_errors = 0;

    loop {
        match records.next_record().await {
            Ok(Some(record)) => {
                read_errors = 0;
                if consumer_alive && tx.send(record).await.is_err() {
                    trace!(process = %label, "Diagnostic consumer gone, discarding output");
                    consumer_alive = false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                read_errors += 1;
                if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(process = %label, error = %e, "Giving up on diagnostics after repeated read errors");
                    break;
                }
                debug!(process = %label, error = %e, "Error reading diagnostics, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

/// Drain a diagnostic stream into the debug log.
pub fn log_diagnostics(mut diagnostics: DiagnosticStream, label: String) {
    tokio::spawn(async move {
        while let Some(line) = diagnostics.recv().await {
            debug!(process = %label, "{line}");
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_forwards_stderr_lines() {
        let spec = CommandSpec::new("sh", "test").args(["-c", "echo one >&2; echo >&2; echo two >&2"]);
        let mut spawned = TokioSpawner.spawn(&spec).unwrap();

        assert_eq!(spawned.diagnostics.recv().await.as_deref(), Some("one"));
        assert_eq!(spawned.diagnostics.recv().await.as_deref(), Some("two"));
        assert_eq!(spawned.diagnostics.recv().await, None);

        let exit = spawned.handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_forwarding() {
        let spec = CommandSpec::new("sh", "test").args([
            "-c",
            "printf 'title: caf\\351\\n' >&2; \
             printf 'frame=1 time=00:00:01.00\\rframe=2 time=00:00:02.00\\r' >&2; \
             echo 'rtmp://host/a: Connection refused' >&2",
        ]);
        let mut spawned = TokioSpawner.spawn(&spec).unwrap();

        let mut lines = Vec::new();
        while let Some(line) = spawned.diagnostics.recv().await {
            lines.push(line);
        }
        assert_eq!(
            lines,
            vec![
                "title: caf\u{FFFD}",
                "frame=1 time=00:00:01.00",
                "frame=2 time=00:00:02.00",
                "rtmp://host/a: Connection refused",
            ]
        );

        let exit = spawned.handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_spawn_passes_environment() {
        let spec = CommandSpec::new("sh", "test")
            .args(["-c", "echo \"$RELAY_TEST\" >&2"])
            .env("RELAY_TEST", "hello");
        let mut spawned = TokioSpawner.spawn(&spec).unwrap();
        assert_eq!(spawned.diagnostics.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/relay-worker", "missing");
        let err = TokioSpawner.spawn(&spec).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
