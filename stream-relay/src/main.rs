use std::path::PathBuf;

use clap::Parser;
use stream_relay::config::SupervisorConfig;
use stream_relay::events::{EventSubscription, SupervisorEvent};
use stream_relay::process::{Executable, detect_version};
use stream_relay::{StreamSupervisor, logging, panic_hook};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay RTMP sources into a local RTSP broker.
#[derive(Debug, Parser)]
#[command(name = "stream-relay", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "STREAM_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for daily log files.
    #[arg(long, env = "STREAM_RELAY_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Log filter directive applied after startup (e.g. `stream_relay=debug`).
    #[arg(long, env = "STREAM_RELAY_LOG_FILTER")]
    log_filter: Option<String>,

    /// Host the broker is reached on.
    #[arg(long, env = "STREAM_RELAY_BROKER_HOST")]
    broker_host: Option<String>,

    /// Port the broker listens on.
    #[arg(long, env = "STREAM_RELAY_BROKER_PORT")]
    broker_port: Option<u16>,

    /// Path to the relay worker (ffmpeg) binary.
    #[arg(long, env = "STREAM_RELAY_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Path to the broker (mediamtx) binary.
    #[arg(long, env = "STREAM_RELAY_BROKER_BIN")]
    broker_bin: Option<PathBuf>,

    /// Source references to relay right away.
    sources: Vec<String>,
}

impl Args {
    fn load_config(&self) -> stream_relay::Result<SupervisorConfig> {
        let mut config = SupervisorConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(path) = &self.worker_bin {
            config.worker.binary_path = Some(path.clone());
        }
        if let Some(path) = &self.broker_bin {
            config.broker.binary_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (logging_config, _guard) = logging::init_logging(&args.log_dir)?;
    panic_hook::install(&args.log_dir);

    if let Some(directive) = &args.log_filter {
        if let Err(e) = logging_config.set_filter(directive) {
            warn!(error = %e, "Keeping the default log filter");
        }
    }

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.child_token());

    let config = args.load_config()?;
    let supervisor = StreamSupervisor::new(config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_filter = %logging_config.get_filter(),
        "stream-relay starting"
    );

    let forwarder = tokio::spawn(forward_events(supervisor.subscribe(), cancel.child_token()));

    match supervisor.start_broker().await {
        Ok(_) => info!(
            "RTSP server listening at {}",
            supervisor.config().broker.target_pattern()
        ),
        Err(e) => warn!(error = %e, "Broker is not available"),
    }
    log_versions(&supervisor);

    if !args.sources.is_empty() {
        match supervisor.create_streams(&args.sources).await {
            Ok(outcome) => info!(
                accepted = outcome.accepted.len(),
                rejected = outcome.rejected.len(),
                failed = outcome.failed.len(),
                "Relayed command-line sources"
            ),
            Err(e) => warn!(error = %e, "Could not relay command-line sources"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    supervisor.shutdown().await;
    cancel.cancel();
    if let Err(e) = forwarder.await {
        debug!(error = %e, "Event forwarder ended abnormally");
    }

    info!("stream-relay stopped");
    Ok(())
}

fn log_versions(supervisor: &StreamSupervisor) {
    for exe in [Executable::Worker, Executable::Broker] {
        match supervisor.locator().locate(exe) {
            Some(path) => match detect_version(&path) {
                Some(version) => info!(executable = %exe, path = %path.display(), "{version}"),
                None => warn!(executable = %exe, path = %path.display(), "Could not detect version"),
            },
            None => warn!(executable = %exe, "Executable not found"),
        }
    }
}

/// Print stream updates as they arrive. Log events are already mirrored to
/// `tracing` by the bus.
async fn forward_events(
    mut events: EventSubscription,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(SupervisorEvent::StreamUpdate { id, status, error }) => match error {
                    Some(error) => info!(stream_id = %id, %status, "Stream update: {error}"),
                    None => info!(stream_id = %id, %status, "Stream update"),
                },
                Some(SupervisorEvent::Log { .. }) => {}
                None => break,
            }
        }
    }
}
