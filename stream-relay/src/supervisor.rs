//! The stream supervisor: the operations exposed to request handlers.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{BrokerStart, BrokerSupervisor};
use crate::config::SupervisorConfig;
use crate::events::{EventBus, EventSubscription};
use crate::probe::{PortProbe, TcpPortProbe};
use crate::process::{Executable, ExecutableLocator, ProcessSpawner, SearchLocator, TokioSpawner};
use crate::relay::{
    BatchOutcome, RelayContext, RelayLauncher, StopReason, StreamStatus, StreamSummary,
};
use crate::Result;

/// Broker and stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub broker_listening: bool,
    pub broker_port: u16,
    /// Streams whose status is exactly `Active`.
    pub active_count: usize,
}

/// Builder for [`StreamSupervisor`] with replaceable OS collaborators.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    probe: Option<Arc<dyn PortProbe>>,
    locator: Option<Arc<dyn ExecutableLocator>>,
}

impl SupervisorBuilder {
    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn locator(mut self, locator: Arc<dyn ExecutableLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn build(self) -> StreamSupervisor {
        let config = Arc::new(self.config);

        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(TokioSpawner) as Arc<dyn ProcessSpawner>);
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(TcpPortProbe::new(config.broker.probe_timeout())) as Arc<dyn PortProbe>
        });
        let locator = self.locator.unwrap_or_else(|| {
            Arc::new(
                SearchLocator::new()
                    .with_override(Executable::Worker, config.worker.binary_path.clone())
                    .with_override(Executable::Broker, config.broker.binary_path.clone())
                    .with_bundle_dir(config.resolved_bundle_dir()),
            ) as Arc<dyn ExecutableLocator>
        });

        let broker = Arc::new(BrokerSupervisor::new(
            config.broker.clone(),
            probe,
            spawner.clone(),
            locator.clone(),
        ));
        let events = EventBus::with_capacity(config.events.capacity);
        let ctx = RelayContext::new(config, events, broker, spawner, locator);

        StreamSupervisor {
            launcher: RelayLauncher::new(ctx.clone()),
            ctx,
        }
    }
}

/// Supervises relay workers and the shared broker.
pub struct StreamSupervisor {
    ctx: RelayContext,
    launcher: RelayLauncher,
}

impl StreamSupervisor {
    /// Supervisor backed by real processes and sockets.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            spawner: None,
            probe: None,
            locator: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.ctx.config
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn broker(&self) -> &BrokerSupervisor {
        &self.ctx.broker
    }

    pub fn locator(&self) -> &dyn ExecutableLocator {
        self.ctx.locator.as_ref()
    }

    /// Subscribe to log and stream-update events.
    pub fn subscribe(&self) -> EventSubscription {
        self.ctx.events.subscribe()
    }

    /// Bring the broker up if nothing is listening on its port.
    pub async fn start_broker(&self) -> Result<BrokerStart> {
        self.ctx.broker.ensure_started().await
    }

    /// Start one relay per source.
    pub async fn create_streams<I, S>(&self, sources: I) -> Result<BatchOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.launcher.launch_batch(sources).await
    }

    /// Stop a single stream.
    ///
    /// Stopping a stream that is already stopped succeeds without an event.
    pub async fn stop_stream(&self, id: &str) -> Result<()> {
        if self.stop_with(id, StopReason::Requested).await? {
            self.ctx.events.log_info(format!("Stopped stream {id}"));
        }
        Ok(())
    }

    /// Stop every stream that is still running.
    ///
    /// Returns how many streams this call stopped. Per-stream failures are
    /// logged, never returned.
    pub async fn stop_all_streams(&self) -> usize {
        let stopped = self.stop_running(StopReason::Requested).await;
        self.ctx.events.log_info("All streams stopped");
        stopped
    }

    /// Broker reachability and the number of active streams.
    ///
    /// With `broker.auto_start_on_status` set, a silent broker is started
    /// first and the state after that attempt is reported.
    pub async fn get_status(&self) -> SupervisorStatus {
        let mut listening = self.ctx.broker.is_listening().await;
        if !listening && self.ctx.config.broker.auto_start_on_status {
            match self.ctx.broker.ensure_started().await {
                Ok(_) => listening = true,
                Err(e) => warn!(error = %e, "Broker auto-start failed"),
            }
        }

        SupervisorStatus {
            broker_listening: listening,
            broker_port: self.ctx.broker.port(),
            active_count: self.ctx.registry.count_with_status(StreamStatus::Active),
        }
    }

    /// Snapshot of every record, oldest first.
    pub fn list_streams(&self) -> Vec<StreamSummary> {
        self.ctx.registry.list()
    }

    pub fn get_stream(&self, id: &str) -> Result<StreamSummary> {
        self.ctx.registry.get(id)
    }

    /// Stop a stream if needed and delete its record.
    pub async fn remove_stream(&self, id: &str) -> Result<StreamSummary> {
        if self.stop_with(id, StopReason::Requested).await? {
            self.ctx.events.log_info(format!("Stopped stream {id}"));
        }
        let removed = self.ctx.registry.remove(id)?;
        debug!(stream_id = %id, "Stream removed");
        Ok(removed)
    }

    /// Stop every stream, then the broker if this supervisor started it.
    pub async fn shutdown(&self) {
        let stopped = self.stop_running(StopReason::Shutdown).await;
        info!(stopped, "Relay streams stopped for shutdown");

        if self.ctx.broker.stop().await.is_none() {
            debug!("No owned broker to stop");
        }
    }

    async fn stop_running(&self, reason: StopReason) -> usize {
        let ids = self.ctx.registry.running_ids();
        let results = join_all(ids.iter().map(|id| self.stop_with(id, reason))).await;

        let mut stopped = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(stream_id = %id, error = %e, "Failed to stop stream"),
            }
        }
        stopped
    }

    /// Mark a stream stopped and terminate its worker.
    ///
    /// Returns `false` when the stream was already stopped.
    async fn stop_with(&self, id: &str, reason: StopReason) -> Result<bool> {
        let transition = match self.ctx.registry.mark_stopped(id, reason, None) {
            Ok(transition) => transition,
            Err(e) if e.is_conflict() => {
                debug!(stream_id = %id, "Stream already stopped");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if let Some(handle) = transition.process {
            let outcome = handle
                .terminate(self.ctx.config.worker.stop_timeout())
                .await;
            if outcome.was_forced() {
                warn!(stream_id = %id, pid = ?handle.pid(), "Relay worker killed after stop timeout");
            } else {
                debug!(stream_id = %id, ?outcome, "Relay worker stopped");
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("streams", &self.ctx.registry.len())
            .field("broker_port", &self.ctx.broker.port())
            .finish()
    }
}

