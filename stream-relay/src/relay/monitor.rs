//! Per-stream supervisory loop.
//!
//! One monitor runs for every record that is not `Stopped`. It watches the
//! worker's diagnostic lines and exit status and moves the record forward:
//!
//! 1. a failure signature stops the stream with the offending line,
//! 2. a worker still alive after the grace period is promoted to `Active`,
//! 3. a worker exiting on its own stops the stream with an exit description,
//! 4. a record stopped by someone else ends the loop without a word.
//!
//! All status writes go through the registry's transition check, so losing a
//! race against a manual stop is a silent no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::registry::StreamRegistry;
use super::state::{StopReason, StreamStatus};
use crate::config::MonitorConfig;
use crate::events::EventBus;
use crate::process::{
    DiagnosticStream, DiagnosticTail, ExitInfo, FailureSignatures, ProcessHandle, progress_time,
};

/// How a monitor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Another monitor already owns the record, or it was stopped before the
    /// loop started.
    NotClaimed,
    /// The record was stopped elsewhere.
    Cancelled,
    /// A failure signature matched this line.
    RuntimeFailure(String),
    /// The worker exited on its own.
    Exited(Option<ExitInfo>),
}

/// Monitor settings shared by every stream.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub grace_period: Duration,
    pub signatures: FailureSignatures,
    pub tail_lines: usize,
    pub exit_drain_timeout: Duration,
    /// Grace given to a worker that reported a failure before it is killed.
    pub worker_stop_timeout: Duration,
}

impl MonitorSettings {
    pub fn new(config: &MonitorConfig, worker_stop_timeout: Duration) -> Self {
        Self {
            grace_period: config.grace_period(),
            signatures: FailureSignatures::new(&config.failure_signatures),
            tail_lines: config.diagnostic_tail_lines,
            exit_drain_timeout: config.exit_drain_timeout(),
            worker_stop_timeout,
        }
    }
}

/// Supervisory loop for a single stream.
pub struct StreamMonitor {
    id: String,
    registry: Arc<StreamRegistry>,
    events: EventBus,
    settings: Arc<MonitorSettings>,
}

impl StreamMonitor {
    pub fn new(
        id: impl Into<String>,
        registry: Arc<StreamRegistry>,
        events: EventBus,
        settings: Arc<MonitorSettings>,
    ) -> Self {
        Self {
            id: id.into(),
            registry,
            events,
            settings,
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self, handle: ProcessHandle, diagnostics: DiagnosticStream) -> JoinHandle<MonitorOutcome> {
        tokio::spawn(self.run(handle, diagnostics))
    }

    /// Drive the stream until it reaches `Stopped`.
    pub async fn run(self, handle: ProcessHandle, mut diagnostics: DiagnosticStream) -> MonitorOutcome {
        let cancel = match self.registry.claim_monitor(&self.id) {
            Ok(token) => token,
            Err(e) => {
                debug!(stream_id = %self.id, error = %e, "Stream not monitored");
                return MonitorOutcome::NotClaimed;
            }
        };

        let mut tail = DiagnosticTail::new(self.settings.tail_lines);
        let mut diagnostics_open = true;
        let mut promoted = false;
        let grace = tokio::time::sleep(self.settings.grace_period);
        tokio::pin!(grace);

        debug!(stream_id = %self.id, pid = ?handle.pid(), "Monitoring stream");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(stream_id = %self.id, "Stream stopped elsewhere, monitor exiting");
                    return MonitorOutcome::Cancelled;
                }

                line = diagnostics.recv(), if diagnostics_open => match line {
                    Some(line) => {
                        if self.settings.signatures.matches(&line).is_some() {
                            self.fail(&handle, &line).await;
                            return MonitorOutcome::RuntimeFailure(line);
                        }
                        if let Some(seconds) = progress_time(&line) {
                            trace!(stream_id = %self.id, seconds, "Relay progress");
                        }
                        tail.push(&line);
                    }
                    None => diagnostics_open = false,
                },

                exit = handle.wait() => {
                    // Lines the worker wrote right before dying may still be in flight.
                    if diagnostics_open {
                        if let Some(line) = self.drain(&mut diagnostics, &mut tail).await {
                            self.fail(&handle, &line).await;
                            return MonitorOutcome::RuntimeFailure(line);
                        }
                    }
                    self.exited(exit, &tail);
                    return MonitorOutcome::Exited(exit);
                }

                _ = &mut grace, if !promoted => {
                    promoted = true;
                    if !handle.has_exited() {
                        self.promote();
                    }
                }
            }
        }
    }

    fn promote(&self) {
        match self.registry.set_status(&self.id, StreamStatus::Active, None) {
            Ok(_) => self
                .events
                .log_info(format!("Stream {} is now active.", self.id)),
            Err(e) => debug!(stream_id = %self.id, error = %e, "Promotion skipped"),
        }
    }

    async fn fail(&self, handle: &ProcessHandle, line: &str) {
        let transition =
            match self
                .registry
                .mark_stopped(&self.id, StopReason::RuntimeFailure, Some(line.to_string()))
            {
                Ok(t) => t,
                Err(e) => {
                    debug!(stream_id = %self.id, error = %e, "Failure already handled");
                    return;
                }
            };

        warn!(stream_id = %self.id, from = %transition.from, line, "Relay worker reported a failure");
        self.events.log_error(line);

        let outcome = handle.terminate(self.settings.worker_stop_timeout).await;
        debug!(stream_id = %self.id, ?outcome, "Failed worker terminated");
    }

    fn exited(&self, exit: Option<ExitInfo>, tail: &DiagnosticTail) {
        let description = exit_description(exit, tail);
        match self.registry.mark_stopped(
            &self.id,
            StopReason::UnexpectedExit,
            Some(description),
        ) {
            Ok(_) => {
                info!(stream_id = %self.id, exit = ?exit, "Relay worker exited");
                self.events
                    .log_error(format!("Stream {} stopped unexpectedly.", self.id));
            }
            Err(e) => debug!(stream_id = %self.id, error = %e, "Exit already handled"),
        }
    }

    /// Read trailing diagnostics until EOF or the drain timeout.
    ///
    /// Returns the first line matching a failure signature.
    async fn drain(
        &self,
        diagnostics: &mut DiagnosticStream,
        tail: &mut DiagnosticTail,
    ) -> Option<String> {
        let deadline = tokio::time::sleep(self.settings.exit_drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                line = diagnostics.recv() => match line {
                    Some(line) if self.settings.signatures.matches(&line).is_some() => {
                        return Some(line);
                    }
                    Some(line) => tail.push(&line),
                    None => return None,
                },
                _ = &mut deadline => {
                    trace!(stream_id = %self.id, "Stopped waiting for trailing diagnostics");
                    return None;
                }
            }
        }
    }
}

/// Human-readable reason for a worker that exited on its own.
pub fn exit_description(exit: Option<ExitInfo>, tail: &DiagnosticTail) -> String {
    let status = exit.map_or_else(|| "unknown status".to_string(), |e| e.to_string());
    match tail.last() {
        Some(line) => format!("Process exited ({status}): {line}"),
        None => format!("Process exited ({status})"),
    }
}
