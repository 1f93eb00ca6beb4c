//! Shared collaborators of the relay components.

use std::sync::Arc;

use super::monitor::MonitorSettings;
use super::registry::StreamRegistry;
use crate::broker::BrokerSupervisor;
use crate::config::SupervisorConfig;
use crate::events::EventBus;
use crate::process::{ExecutableLocator, ProcessSpawner};

/// Everything a launcher, monitor or stop request needs, passed explicitly
/// instead of living in globals.
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<SupervisorConfig>,
    pub registry: Arc<StreamRegistry>,
    pub events: EventBus,
    pub broker: Arc<BrokerSupervisor>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub locator: Arc<dyn ExecutableLocator>,
    pub monitor: Arc<MonitorSettings>,
}

impl RelayContext {
    pub fn new(
        config: Arc<SupervisorConfig>,
        events: EventBus,
        broker: Arc<BrokerSupervisor>,
        spawner: Arc<dyn ProcessSpawner>,
        locator: Arc<dyn ExecutableLocator>,
    ) -> Self {
        let monitor = Arc::new(MonitorSettings::new(
            &config.monitor,
            config.worker.stop_timeout(),
        ));
        Self {
            config,
            registry: Arc::new(StreamRegistry::with_events(events.clone())),
            events,
            broker,
            spawner,
            locator,
            monitor,
        }
    }
}
