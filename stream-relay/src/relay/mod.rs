//! Relay streams: records, workers and their monitors.

mod command;
mod context;
mod launcher;
mod monitor;
mod registry;
mod state;

pub use command::worker_command;
pub use context::RelayContext;
pub use launcher::{BatchOutcome, RelayLauncher};
pub use monitor::{MonitorOutcome, MonitorSettings, StreamMonitor, exit_description};
pub use registry::{StreamRegistry, StreamSummary, Transition};
pub use state::{StopReason, StreamStatus};
