//! The process launch capability and its operating-system implementation.

use std::fs::DirBuilder;
use std::io;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use super::SUPERVISOR_TARGET;
use crate::LaunchConfig;

/// Starts helper processes and delivers signals to them.
///
/// Production code uses [`SystemLauncher`]; tests inject an in-memory fake so
/// no real helper is spawned.
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the helper described by `config`.
    fn spawn(&self, config: &LaunchConfig) -> io::Result<Box<dyn SpawnedProcess>>;

    /// Asks the process to exit. Succeeds when the process is already gone.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Kills the process without giving it a chance to clean up.
    fn force_kill(&self, pid: u32) -> io::Result<()>;

    /// Reports whether a process with this pid currently exists.
    fn is_alive(&self, pid: u32) -> io::Result<bool>;

    /// Returns the argument vector of a running process, program first.
    ///
    /// `None` means the process is gone or the platform cannot tell.
    fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>>;
}

/// A running process whose exit can be awaited from a watcher thread.
pub trait SpawnedProcess: Send {
    /// Operating-system process id.
    fn id(&self) -> u32;

    /// Blocks until the process exits and returns its exit code, if any.
    fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Launcher backed by `std::process::Command` and POSIX signals.
#[derive(Debug, Clone, Copy)]
pub struct SystemLauncher {
    owner_pid: u32,
}

impl SystemLauncher {
    /// Builds a launcher that registers the current process as the helper's
    /// owning controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner_pid: std::process::id(),
        }
    }
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, config: &LaunchConfig) -> io::Result<Box<dyn SpawnedProcess>> {
        prepare_data_dir(config)?;
        let args = config.helper_arguments(self.owner_pid);
        debug!(
            target: SUPERVISOR_TARGET,
            executable = %config.executable(),
            args = ?args,
            "spawning helper process"
        );
        let child = Command::new(config.executable().as_std_path())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        signal::terminate(pid)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        signal::force_kill(pid)
    }

    fn is_alive(&self, pid: u32) -> io::Result<bool> {
        signal::is_alive(pid)
    }

    fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>> {
        proc_command_line(pid)
    }
}

#[cfg(target_os = "linux")]
fn proc_command_line(pid: u32) -> io::Result<Option<Vec<String>>> {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => Ok(Some(
            raw.split(|byte| *byte == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        )),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

#[cfg(not(target_os = "linux"))]
const fn proc_command_line(_pid: u32) -> io::Result<Option<Vec<String>>> {
    Ok(None)
}

struct ChildProcess {
    child: Child,
}

impl SpawnedProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().map(|status| status.code())
    }
}

/// Tor refuses a data directory that is readable by other users.
fn prepare_data_dir(config: &LaunchConfig) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(config.data_dir().as_std_path())
}

#[cfg(unix)]
mod signal {
    use std::io;

    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    fn pid_of(pid: u32) -> io::Result<Pid> {
        i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
    }

    fn deliver(pid: u32, signal: Signal) -> io::Result<()> {
        match kill(pid_of(pid)?, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    pub(super) fn terminate(pid: u32) -> io::Result<()> {
        deliver(pid, Signal::SIGTERM)
    }

    pub(super) fn force_kill(pid: u32) -> io::Result<()> {
        deliver(pid, Signal::SIGKILL)
    }

    pub(super) fn is_alive(pid: u32) -> io::Result<bool> {
        if pid == 0 {
            return Ok(false);
        }
        match kill(pid_of(pid)?, None) {
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(not(unix))]
mod signal {
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is only supported on unix",
        )
    }

    pub(super) fn terminate(_pid: u32) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) fn force_kill(_pid: u32) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) fn is_alive(_pid: u32) -> io::Result<bool> {
        Err(unsupported())
    }
}
