//! Turning source references into running relay workers.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::command::worker_command;
use super::context::RelayContext;
use super::monitor::StreamMonitor;
use super::registry::StreamSummary;
use super::state::{StopReason, StreamStatus};
use crate::process::Executable;
use crate::utils::url::{extract_host, has_scheme};
use crate::{Error, Result};

/// Result of a batch launch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    /// Records whose worker was spawned and is being monitored.
    pub accepted: Vec<StreamSummary>,
    /// Source references that failed validation, as given.
    pub rejected: Vec<String>,
    /// Records created but stopped because the worker could not be spawned.
    pub failed: Vec<StreamSummary>,
}

/// Validates sources, spawns workers and hands them to monitors.
pub struct RelayLauncher {
    ctx: RelayContext,
}

impl RelayLauncher {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    /// Launch one relay per source.
    ///
    /// The broker must be listening before anything is spawned; if it cannot
    /// be brought up the whole batch fails and no record is created.
    /// Malformed sources are skipped individually.
    pub async fn launch_batch<I, S>(&self, sources: I) -> Result<BatchOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sources: Vec<String> = sources
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .collect();
        if sources.is_empty() {
            return Err(Error::validation("no source references provided"));
        }

        if let Err(e) = self.ctx.broker.ensure_started().await {
            let reason = match &e {
                Error::BrokerUnavailable(reason) => reason.clone(),
                other => other.to_string(),
            };
            self.ctx
                .events
                .log_error(format!("Failed to start broker: {reason}"));
            return Err(e);
        }

        let worker = self.ctx.locator.locate(Executable::Worker);
        let mut outcome = BatchOutcome::default();

        for source in sources {
            if !has_scheme(&source, &self.ctx.config.worker.source_scheme) {
                debug!(source = %source, "Rejecting source reference");
                self.ctx
                    .events
                    .log_error(format!("Invalid source URL: {source}"));
                outcome.rejected.push(source);
                continue;
            }

            match self.launch(&source, worker.as_deref()) {
                Ok(summary) => outcome.accepted.push(summary),
                Err(summary) => outcome.failed.push(summary),
            }
        }

        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            failed = outcome.failed.len(),
            "Relay batch processed"
        );
        Ok(outcome)
    }

    /// Create, spawn and monitor a single stream.
    ///
    /// `Err` carries the summary of a record stopped by a spawn failure.
    fn launch(
        &self,
        source: &str,
        worker: Option<&std::path::Path>,
    ) -> std::result::Result<StreamSummary, StreamSummary> {
        let broker = &self.ctx.config.broker;
        let summary = self
            .ctx
            .registry
            .create(source, |id| broker.target_ref(id));
        let id = summary.id.clone();

        let spawned = match worker {
            Some(binary) => {
                let spec = worker_command(
                    binary,
                    &self.ctx.config.worker,
                    &id,
                    source,
                    &summary.target_ref,
                );
                self.ctx
                    .spawner
                    .spawn(&spec)
                    .map_err(|e| Error::spawn(binary.display().to_string(), e))
            }
            None => Err(Error::Spawn {
                program: Executable::Worker.file_name(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "executable not found",
                ),
            }),
        };

        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => return Err(self.spawn_failed(summary, &e)),
        };

        if let Err(e) = self.ctx.registry.attach_process(&id, spawned.handle.clone()) {
            // Stopped while we were spawning; nobody else will reap this child.
            warn!(stream_id = %id, error = %e, "Stream stopped during launch, terminating worker");
            let handle = spawned.handle;
            let grace = self.ctx.config.worker.stop_timeout();
            tokio::spawn(async move {
                handle.terminate(grace).await;
            });
            return Ok(self.ctx.registry.get(&id).unwrap_or(summary));
        }

        // Snapshot before the monitor runs; a worker that dies at once must
        // still be reported as accepted in `Starting`.
        let accepted = StreamSummary {
            pid: spawned.handle.pid(),
            ..summary
        };

        StreamMonitor::new(
            &id,
            self.ctx.registry.clone(),
            self.ctx.events.clone(),
            self.ctx.monitor.clone(),
        )
        .spawn(spawned.handle, spawned.diagnostics);

        info!(
            stream_id = %id,
            source_host = ?extract_host(source),
            target = %accepted.target_ref,
            "Relay worker started"
        );
        self.ctx.events.log_info(format!(
            "Starting stream {id}: {source} -> {}",
            accepted.target_ref
        ));
        Ok(accepted)
    }

    fn spawn_failed(&self, summary: StreamSummary, error: &Error) -> StreamSummary {
        let id = summary.id.as_str();
        let cause = match error {
            Error::Spawn { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        warn!(stream_id = %id, error = %error, "Failed to spawn relay worker");

        if let Err(e) = self
            .ctx
            .registry
            .mark_stopped(id, StopReason::SpawnFailed, Some(cause.clone()))
        {
            debug!(stream_id = %id, error = %e, "Stream already stopped");
        }
        self.ctx
            .events
            .log_error(format!("Failed to start stream {id}: {cause}"));

        match self.ctx.registry.get(id) {
            Ok(current) => current,
            Err(_) => StreamSummary {
                status: StreamStatus::Stopped,
                error: Some(cause),
                stop_reason: Some(StopReason::SpawnFailed),
                ..summary
            },
        }
    }
}
