//! Relay worker invocation.

use std::path::Path;

use crate::config::WorkerConfig;
use crate::process::CommandSpec;

/// Build the ffmpeg command that copies `source` to `target` without re-encoding.
pub fn worker_command(
    binary: &Path,
    config: &WorkerConfig,
    stream_id: &str,
    source: &str,
    target: &str,
) -> CommandSpec {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];

    // Keep startup probing short so a relay comes up quickly.
    args.extend([
        "-analyzeduration".to_string(),
        config.analyze_duration_us.to_string(),
        "-probesize".to_string(),
        config.probe_size.to_string(),
    ]);
    args.extend(config.input_args.iter().cloned());
    args.extend(["-i".to_string(), source.to_string()]);

    // Pass-through copy of both elementary streams.
    args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
    args.extend(config.output_args.iter().cloned());

    args.extend([
        "-f".to_string(),
        "rtsp".to_string(),
        "-rtsp_transport".to_string(),
        config.transport.clone(),
        target.to_string(),
    ]);

    CommandSpec::new(binary, format!("relay-{stream_id}"))
        .args(args)
        .env("LC_ALL", "C")
}
