//! Executable discovery for the worker and broker binaries.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// The two external binaries the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Executable {
    /// Per-stream relay worker (ffmpeg).
    Worker,
    /// Shared media broker (MediaMTX).
    Broker,
}

impl Executable {
    /// Base file name, without platform extension.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Worker => "ffmpeg",
            Self::Broker => "mediamtx",
        }
    }

    /// File name with the platform's executable extension.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.file_stem(), std::env::consts::EXE_SUFFIX)
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Resolves executables to paths.
pub trait ExecutableLocator: Send + Sync {
    /// Path to `exe`, or `None` when it cannot be found.
    fn locate(&self, exe: Executable) -> Option<PathBuf>;
}

/// Default search order: explicit override, bundled copy, working directory, `PATH`.
#[derive(Debug, Clone, Default)]
pub struct SearchLocator {
    worker_override: Option<PathBuf>,
    broker_override: Option<PathBuf>,
    bundle_dir: Option<PathBuf>,
    search_path: Option<std::ffi::OsString>,
}

impl SearchLocator {
    pub fn new() -> Self {
        Self {
            search_path: std::env::var_os("PATH"),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, exe: Executable, path: Option<PathBuf>) -> Self {
        match exe {
            Executable::Worker => self.worker_override = path,
            Executable::Broker => self.broker_override = path,
        }
        self
    }

    pub fn with_bundle_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bundle_dir = dir;
        self
    }

    /// Replace the `PATH` value that is searched last.
    pub fn with_search_path(mut self, path: Option<std::ffi::OsString>) -> Self {
        self.search_path = path;
        self
    }

    fn explicit(&self, exe: Executable) -> Option<&Path> {
        match exe {
            Executable::Worker => self.worker_override.as_deref(),
            Executable::Broker => self.broker_override.as_deref(),
        }
    }

    fn candidates(&self, exe: Executable) -> Vec<PathBuf> {
        let name = exe.file_name();
        let mut candidates = Vec::new();

        if let Some(path) = self.explicit(exe) {
            // A bare command name is resolved through PATH below.
            if path.components().count() > 1 || path.is_absolute() {
                candidates.push(path.to_path_buf());
            } else {
                candidates.extend(self.on_search_path(&path.to_string_lossy()));
            }
        }
        if let Some(dir) = &self.bundle_dir {
            candidates.push(dir.join(exe.file_stem()).join(&name));
        }
        candidates.push(Path::new(".").join(exe.file_stem()).join(&name));
        candidates.push(Path::new(".").join(&name));
        candidates.extend(self.on_search_path(&name));
        candidates
    }

    fn on_search_path(&self, name: &str) -> Vec<PathBuf> {
        self.search_path
            .as_ref()
            .map(|paths| std::env::split_paths(paths).map(|dir| dir.join(name)).collect())
            .unwrap_or_default()
    }
}

impl ExecutableLocator for SearchLocator {
    fn locate(&self, exe: Executable) -> Option<PathBuf> {
        let found = self.candidates(exe).into_iter().find(|p| p.is_file());
        match &found {
            Some(path) => debug!(executable = %exe, path = %path.display(), "Located executable"),
            None => debug!(executable = %exe, "Executable not found"),
        }
        found
    }
}

/// First line of `<binary> -version`, if the binary runs.
pub fn detect_version(path: &Path) -> Option<String> {
    process_utils::std_command(path)
        .arg("-version")
        .output()
        .ok()
        .and_then(|output| {
            let text = if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            };
            String::from_utf8(text)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        })
        .filter(|line| !line.is_empty())
}
