//! Process helpers shared across the workspace.
//!
//! Children spawned through these helpers never pop up a console window on
//! Windows and, on Unix, can be placed in their own process group so that the
//! whole tree (the child and everything it forks) can be signalled at once.

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a windowless `std::process::Command`.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a windowless `tokio::process::Command` that leads its own process group.
///
/// The child's pid doubles as its process-group id on Unix, which is what
/// [`terminate_tree`] and [`kill_tree`] signal.
#[cfg(feature = "tokio")]
pub fn tokio_group_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Ask a process tree to exit (SIGTERM to the group on Unix, `taskkill /T` on Windows).
///
/// A tree that is already gone is not an error.
pub fn terminate_tree(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGTERM)
    }
    #[cfg(windows)]
    {
        taskkill(pid, false)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(io::Error::new(io::ErrorKind::Unsupported, "process tree signalling"))
    }
}

/// Forcibly kill a process tree (SIGKILL to the group on Unix, `taskkill /F /T` on Windows).
pub fn kill_tree(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        signal_group(pid, libc::SIGKILL)
    }
    #[cfg(windows)]
    {
        taskkill(pid, true)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(io::Error::new(io::ErrorKind::Unsupported, "process tree signalling"))
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid 0"));
    }

    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group led by our own child.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut cmd = std_command("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|_| ())
}
