use chrono::Local;
use std::{
    backtrace::Backtrace,
    fs::OpenOptions,
    io::Write,
    panic::{AssertUnwindSafe, PanicHookInfo, take_hook},
    path::Path,
    thread,
};

use crate::logging::LOG_FILE_PREFIX;

/// Installs a global panic hook that logs panics via `tracing` and appends a
/// panic record to the current daily log file in `log_dir`.
///
/// The file append only happens in `panic = "abort"` builds, where the
/// non-blocking log writer may not flush before the process aborts.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        // A panic inside the hook must not mask the original one.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let record = format_panic_record(panic_info);
            tracing::error!(target: "stream_relay::panic", "{record}");

            if cfg!(panic = "abort") && append_panic_record(&log_dir, &record).is_err() {
                eprintln!("failed to append panic record to {}", log_dir.display());
            }
        }));

        previous_hook(panic_info);
    }));
}

/// Append `record` to today's log file (same naming as the daily appender).
fn append_panic_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let path = log_dir.join(format!("{LOG_FILE_PREFIX}.{}", Local::now().format("%Y-%m-%d")));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let location = match panic_info.location() {
        Some(loc) => format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        None => "<unknown>".to_string(),
    };
    let current = thread::current();
    let thread_name = current.name().unwrap_or("<unnamed>");

    format!(
        "{} PANIC thread={thread_name} location={location} payload={}\nBacktrace:\n{}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        panic_message(panic_info),
        Backtrace::force_capture(),
    )
}

/// The panic message, whether it was a literal or a formatted string.
fn panic_message(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| panic_info.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_panic_record_uses_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        append_panic_record(dir.path(), "PANIC one").unwrap();
        append_panic_record(dir.path(), "PANIC two").unwrap();

        let today = format!("{LOG_FILE_PREFIX}.{}", Local::now().format("%Y-%m-%d"));
        let content = std::fs::read_to_string(dir.path().join(today)).unwrap();
        assert_eq!(content, "PANIC one\nPANIC two\n");
    }
}
