//! Lifecycle of the single shared media broker.
//!
//! The broker may have been started by us, by an earlier run, or by someone
//! else entirely. Whatever answers on the broker port counts as running; only
//! a process this supervisor spawned itself is ever stopped.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::probe::PortProbe;
use crate::process::{
    CommandSpec, Executable, ExecutableLocator, ProcessHandle, ProcessSpawner, TerminationOutcome,
    log_diagnostics,
};
use crate::{Error, Result};

/// Whether the broker port answers, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Listening,
    NotListening,
}

/// How [`BrokerSupervisor::ensure_started`] succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStart {
    /// The port was already answering; nothing was spawned.
    AlreadyListening,
    /// A broker we own became ready.
    Started,
}

/// Owns the broker process this supervisor spawned, if any.
pub struct BrokerSupervisor {
    config: BrokerConfig,
    probe: Arc<dyn PortProbe>,
    spawner: Arc<dyn ProcessSpawner>,
    locator: Arc<dyn ExecutableLocator>,
    /// Held across every start/stop so they never overlap.
    owned: Mutex<Option<ProcessHandle>>,
}

impl BrokerSupervisor {
    pub fn new(
        config: BrokerConfig,
        probe: Arc<dyn PortProbe>,
        spawner: Arc<dyn ProcessSpawner>,
        locator: Arc<dyn ExecutableLocator>,
    ) -> Self {
        Self {
            config,
            probe,
            spawner,
            locator,
            owned: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub async fn is_listening(&self) -> bool {
        self.probe
            .is_listening(&self.config.host, self.config.port)
            .await
    }

    pub async fn state(&self) -> BrokerState {
        if self.is_listening().await {
            BrokerState::Listening
        } else {
            BrokerState::NotListening
        }
    }

    /// Whether a broker spawned by this supervisor is being held.
    pub async fn owns_process(&self) -> bool {
        self.owned.lock().await.is_some()
    }

    /// Make sure something is listening on the broker port.
    ///
    /// Spawns the broker only when the port is silent, then polls it a fixed
    /// number of times. A broker that never answers is left running and the
    /// caller gets [`Error::BrokerUnavailable`].
    pub async fn ensure_started(&self) -> Result<BrokerStart> {
        let mut owned = self.owned.lock().await;

        if self.is_listening().await {
            debug!(port = self.config.port, "Broker already listening");
            return Ok(BrokerStart::AlreadyListening);
        }

        // Forget a broker of ours that has since died.
        if owned.as_ref().is_some_and(ProcessHandle::has_exited) {
            if let Some(dead) = owned.take() {
                warn!(pid = ?dead.pid(), exit = ?dead.try_exit(), "Owned broker process has exited");
            }
        }

        let handle = match owned.as_ref() {
            Some(running) => {
                debug!(pid = ?running.pid(), "Owned broker still starting, waiting for readiness");
                running.clone()
            }
            None => {
                let handle = self.spawn()?;
                *owned = Some(handle.clone());
                handle
            }
        };

        for attempt in 1..=self.config.readiness_attempts {
            tokio::time::sleep(self.config.readiness_interval()).await;

            if self.is_listening().await {
                info!(
                    port = self.config.port,
                    attempt,
                    "Broker started successfully"
                );
                return Ok(BrokerStart::Started);
            }

            if let Some(exit) = handle.try_exit() {
                owned.take();
                return Err(Error::broker_unavailable(format!(
                    "broker exited ({exit}) before listening on port {}",
                    self.config.port
                )));
            }
        }

        warn!(
            port = self.config.port,
            attempts = self.config.readiness_attempts,
            "Broker started but port not responding"
        );
        Err(Error::broker_unavailable(format!(
            "broker started but port {} not responding",
            self.config.port
        )))
    }

    fn spawn(&self) -> Result<ProcessHandle> {
        let path = self
            .locator
            .locate(Executable::Broker)
            .ok_or_else(|| {
                Error::broker_unavailable(format!(
                    "{} executable not found",
                    Executable::Broker.file_stem()
                ))
            })?;

        let spec = CommandSpec::new(&path, "broker");
        let spawned = self.spawner.spawn(&spec).map_err(|e| {
            Error::broker_unavailable(format!("failed to start {}: {e}", path.display()))
        })?;

        info!(path = %path.display(), pid = ?spawned.handle.pid(), "Spawned broker");
        log_diagnostics(spawned.diagnostics, spec.label);
        Ok(spawned.handle)
    }

    /// Stop the broker this supervisor spawned.
    ///
    /// A no-op when the broker was started externally.
    pub async fn stop(&self) -> Option<TerminationOutcome> {
        let mut owned = self.owned.lock().await;
        let handle = owned.take()?;

        let outcome = handle.terminate(self.config.stop_timeout()).await;
        if outcome.was_forced() {
            warn!(pid = ?handle.pid(), "Broker did not stop gracefully and was killed");
        } else {
            info!(pid = ?handle.pid(), "Broker stopped");
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SpawnedProcess;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Probe whose answer is flipped by the test.
    #[derive(Default)]
    struct SwitchProbe {
        listening: AtomicBool,
        /// Start answering after this many probes (0 = never switch).
        listen_after: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PortProbe for SwitchProbe {
        async fn is_listening(&self, _host: &str, _port: u16) -> bool {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let after = self.listen_after.load(Ordering::SeqCst);
            if after > 0 && calls >= after {
                self.listening.store(true, Ordering::SeqCst);
            }
            self.listening.load(Ordering::SeqCst)
        }
    }

    struct FixedLocator(Option<PathBuf>);

    impl ExecutableLocator for FixedLocator {
        fn locate(&self, _exe: Executable) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    /// Spawns `sh -c <script>` regardless of the requested program.
    struct ShellSpawner {
        script: &'static str,
        spawned: AtomicUsize,
    }

    impl ShellSpawner {
        fn new(script: &'static str) -> Self {
            Self {
                script,
                spawned: AtomicUsize::new(0),
            }
        }
    }

    impl ProcessSpawner for ShellSpawner {
        fn spawn(&self, spec: &CommandSpec) -> std::io::Result<SpawnedProcess> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let spec = CommandSpec::new("sh", spec.label.clone()).args(["-c", self.script]);
            crate::process::TokioSpawner.spawn(&spec)
        }
    }

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            readiness_attempts: 3,
            readiness_interval_ms: 10,
            stop_timeout_ms: 2000,
            ..BrokerConfig::default()
        }
    }

    fn supervisor(
        probe: Arc<SwitchProbe>,
        spawner: Arc<ShellSpawner>,
        locator: Option<PathBuf>,
    ) -> BrokerSupervisor {
        BrokerSupervisor::new(
            fast_config(),
            probe,
            spawner,
            Arc::new(FixedLocator(locator)),
        )
    }

    #[tokio::test]
    async fn test_already_listening_spawns_nothing() {
        let probe = Arc::new(SwitchProbe::default());
        probe.listening.store(true, Ordering::SeqCst);
        let spawner = Arc::new(ShellSpawner::new("sleep 30"));
        let broker = supervisor(probe, spawner.clone(), Some("/opt/mediamtx".into()));

        assert_eq!(broker.ensure_started().await.unwrap(), BrokerStart::AlreadyListening);
        assert_eq!(broker.ensure_started().await.unwrap(), BrokerStart::AlreadyListening);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
        assert!(!broker.owns_process().await);
        assert!(broker.stop().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawns_and_waits_for_readiness() {
        let probe = Arc::new(SwitchProbe::default());
        // First probe is the idempotency check, the third one succeeds.
        probe.listen_after.store(3, Ordering::SeqCst);
        let spawner = Arc::new(ShellSpawner::new("sleep 30"));
        let broker = supervisor(probe, spawner.clone(), Some("/opt/mediamtx".into()));

        assert_eq!(broker.ensure_started().await.unwrap(), BrokerStart::Started);
        assert!(broker.owns_process().await);

        // Port answers now: the second call is a no-op.
        assert_eq!(broker.ensure_started().await.unwrap(), BrokerStart::AlreadyListening);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);

        let outcome = broker.stop().await.unwrap();
        assert!(!outcome.was_forced());
        assert!(!broker.owns_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unready_broker_is_kept_and_reused() {
        let probe = Arc::new(SwitchProbe::default());
        let spawner = Arc::new(ShellSpawner::new("sleep 30"));
        let broker = supervisor(probe, spawner.clone(), Some("/opt/mediamtx".into()));

        let err = broker.ensure_started().await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)));
        assert!(broker.owns_process().await);

        assert!(broker.ensure_started().await.is_err());
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);

        broker.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broker_that_exits_is_reported() {
        let probe = Arc::new(SwitchProbe::default());
        let spawner = Arc::new(ShellSpawner::new("exit 2"));
        let broker = supervisor(probe, spawner, Some("/opt/mediamtx".into()));

        // Give the short-lived child a chance to be reaped within the window.
        let mut config = fast_config();
        config.readiness_interval_ms = 100;
        let broker = BrokerSupervisor { config, ..broker };

        let err = broker.ensure_started().await.unwrap_err();
        assert!(err.to_string().contains("code 2"), "{err}");
        assert!(!broker.owns_process().await);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let probe = Arc::new(SwitchProbe::default());
        let spawner = Arc::new(ShellSpawner::new("sleep 30"));
        let broker = supervisor(probe, spawner.clone(), None);

        let err = broker.ensure_started().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_follows_probe() {
        let probe = Arc::new(SwitchProbe::default());
        let broker = supervisor(probe.clone(), Arc::new(ShellSpawner::new("")), None);
        assert_eq!(broker.state().await, BrokerState::NotListening);
        probe.listening.store(true, Ordering::SeqCst);
        assert_eq!(broker.state().await, BrokerState::Listening);
    }
}
