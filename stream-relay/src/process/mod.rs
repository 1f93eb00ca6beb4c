//! Child process plumbing: spawning, watching, terminating and locating binaries.

mod diagnostics;
mod handle;
mod locator;
mod records;
mod spawner;

pub use diagnostics::{
    DiagnosticTail, FailureSignatures, is_progress_line, parse_time, progress_time,
};
pub use handle::{ExitInfo, ProcessHandle, TerminationOutcome};
pub use locator::{Executable, ExecutableLocator, SearchLocator, detect_version};
pub use spawner::{
    CommandSpec, DiagnosticStream, ProcessSpawner, SpawnedProcess, TokioSpawner, log_diagnostics,
};
