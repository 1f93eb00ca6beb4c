//! Supervisor configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields
//! a working local setup: broker on `localhost:8554`, five second grace period.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub events: EventsConfig,
    /// Directory searched for bundled executables.
    ///
    /// Defaults to the directory holding the running binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Load a configuration file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::io_path("reading config", path, e))?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Reject values the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.port == 0 {
            return Err(Error::config("broker.port must be non-zero"));
        }
        if self.broker.host.trim().is_empty() {
            return Err(Error::config("broker.host must not be empty"));
        }
        if self.broker.scheme.trim().is_empty() {
            return Err(Error::config("broker.scheme must not be empty"));
        }
        if self.broker.readiness_attempts == 0 {
            return Err(Error::config("broker.readiness_attempts must be at least 1"));
        }
        if self.worker.source_scheme.trim().is_empty() {
            return Err(Error::config("worker.source_scheme must not be empty"));
        }
        if self.monitor.failure_signatures.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::config(
                "monitor.failure_signatures must contain at least one pattern",
            ));
        }
        if self.events.capacity == 0 {
            return Err(Error::config("events.capacity must be at least 1"));
        }
        Ok(())
    }

    /// Bundle directory, falling back to the running binary's directory.
    pub fn resolved_bundle_dir(&self) -> Option<PathBuf> {
        self.bundle_dir.clone().or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
        })
    }
}

/// Shared broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Scheme of the relayed (pull-side) URLs.
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    pub readiness_attempts: u32,
    pub readiness_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Try to bring the broker up when a status query finds it down.
    pub auto_start_on_status: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8554,
            scheme: "rtsp".to_string(),
            binary_path: None,
            readiness_attempts: 10,
            readiness_interval_ms: 500,
            probe_timeout_ms: 1000,
            stop_timeout_ms: 5000,
            auto_start_on_status: true,
        }
    }
}

impl BrokerConfig {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// URL under which a relayed stream is published.
    pub fn target_ref(&self, stream_id: &str) -> String {
        format!("{}://{}:{}/{}", self.scheme, self.host, self.port, stream_id)
    }

    /// URL pattern for log output.
    pub fn target_pattern(&self) -> String {
        self.target_ref("<stream_id>")
    }
}

/// Relay worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    /// Scheme every source reference must carry.
    pub source_scheme: String,
    pub analyze_duration_us: u64,
    pub probe_size: u64,
    /// Transport forced on the output side.
    pub transport: String,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
    pub stop_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            source_scheme: "rtmp".to_string(),
            analyze_duration_us: 1_000_000,
            probe_size: 1_000_000,
            transport: "tcp".to_string(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            stop_timeout_ms: 3000,
        }
    }
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Stream monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay after spawn before a quiet worker is considered active.
    pub grace_period_ms: u64,
    /// Case-insensitive substrings that mark a diagnostic line as fatal.
    pub failure_signatures: Vec<String>,
    /// Diagnostic lines kept for exit descriptions.
    pub diagnostic_tail_lines: usize,
    /// How long to wait for trailing diagnostics once the worker exited.
    pub exit_drain_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
            failure_signatures: vec![
                "could not open".to_string(),
                "no such file".to_string(),
                "connection refused".to_string(),
                "not found".to_string(),
            ],
            diagnostic_tail_lines: 5,
            exit_drain_timeout_ms: 500,
        }
    }
}

impl MonitorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn exit_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_drain_timeout_ms)
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}
