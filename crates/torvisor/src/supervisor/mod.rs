//! Ownership of the external helper process.
//!
//! The supervisor launches the helper, watches it from a dedicated thread and
//! reports exits through a notice sink. Exits are edge-triggered: each
//! process lifetime produces at most one [`UnexpectedExit`], and exits of
//! processes the supervisor killed itself are swallowed.

mod error;
mod launcher;
mod reaper;

use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::LaunchConfig;

pub use self::error::SupervisorError;
pub use self::launcher::{ProcessLauncher, SpawnedProcess, SystemLauncher};
pub use self::reaper::{DEFAULT_REAP_GRACE, ReapOutcome, StaleReaped};
use self::reaper::Reaper;

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Receives notices from supervisor worker threads.
pub type NoticeSink = Arc<dyn Fn(SupervisorNotice) + Send + Sync>;

/// Identity of one launched helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
    launch: u64,
}

impl ProcessHandle {
    /// Operating-system process id.
    #[must_use]
    pub const fn pid(self) -> u32 {
        self.pid
    }

    /// Sequence number of the launch that produced this handle.
    #[must_use]
    pub const fn launch(self) -> u64 {
        self.launch
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} (launch {})", self.pid, self.launch)
    }
}

/// How a watched process ended, as seen by its watcher thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited; the code is absent when it died from a signal.
    Exited(Option<i32>),
    /// Waiting on the process failed, so its fate is unknown.
    WatchFailed(String),
}

/// Exit report posted by a watcher thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Handle of the process that ended.
    pub handle: ProcessHandle,
    /// What the watcher observed.
    pub status: ExitStatus,
}

/// An exit the supervisor did not ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnexpectedExit {
    /// The helper process terminated.
    ProcessCrashed {
        /// Pid of the crashed helper.
        pid: u32,
    },
    /// The watch on the helper was lost.
    LauncherLost,
}

/// Messages posted from supervisor worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorNotice {
    /// A watched process ended.
    Exited(ProcessExit),
    /// A stale helper termination job finished.
    StaleReaped(StaleReaped),
}

/// Result of looking for a helper left behind by a previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleCheck {
    /// Nothing to clean up; launching may proceed.
    Clear,
    /// A stale helper is being terminated; wait for
    /// [`SupervisorNotice::StaleReaped`].
    Reaping {
        /// Pid of the stale helper.
        pid: u32,
    },
}

/// Launches and watches the helper process.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    notices: NoticeSink,
    reaper: Reaper,
    current: Option<ProcessHandle>,
    launches: u64,
}

impl ProcessSupervisor {
    /// Builds a supervisor using the default stale-helper grace period.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, notices: NoticeSink) -> Self {
        Self::with_reap_grace(launcher, notices, DEFAULT_REAP_GRACE)
    }

    /// Builds a supervisor with a custom stale-helper grace period.
    #[must_use]
    pub fn with_reap_grace(
        launcher: Arc<dyn ProcessLauncher>,
        notices: NoticeSink,
        grace: Duration,
    ) -> Self {
        let reaper = Reaper::spawn(Arc::clone(&launcher), Arc::clone(&notices), grace);
        Self {
            launcher,
            notices,
            reaper,
            current: None,
            launches: 0,
        }
    }

    /// Handle of the live helper, if any.
    #[must_use]
    pub const fn current(&self) -> Option<ProcessHandle> {
        self.current
    }

    /// Launches the helper described by `config` and starts watching it.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] while a handle is live,
    /// [`SupervisorError::InvalidConfig`] for an empty configuration and
    /// [`SupervisorError::LaunchFailed`] when the process cannot be spawned.
    pub fn launch(&mut self, config: &LaunchConfig) -> Result<ProcessHandle, SupervisorError> {
        if let Some(handle) = self.current {
            return Err(SupervisorError::AlreadyRunning { pid: handle.pid });
        }
        if config.is_empty() {
            return Err(SupervisorError::InvalidConfig);
        }

        let failed = |source: io::Error| SupervisorError::LaunchFailed {
            executable: config.executable().to_owned(),
            source,
        };
        let process = self.launcher.spawn(config).map_err(failed)?;
        self.launches += 1;
        let handle = ProcessHandle {
            pid: process.id(),
            launch: self.launches,
        };

        if let Err(source) = self.watch(handle, process) {
            if let Err(error) = self.launcher.force_kill(handle.pid) {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid = handle.pid,
                    error = %error,
                    "failed to kill unwatched helper"
                );
            }
            return Err(failed(source));
        }

        info!(
            target: SUPERVISOR_TARGET,
            pid = handle.pid,
            launch = handle.launch,
            executable = %config.executable(),
            "helper process launched"
        );
        self.current = Some(handle);
        Ok(handle)
    }

    fn watch(&self, handle: ProcessHandle, mut process: Box<dyn SpawnedProcess>) -> io::Result<()> {
        let notices = Arc::clone(&self.notices);
        thread::Builder::new()
            .name(format!("torvisor-watch-{}", handle.pid))
            .spawn(move || {
                let status = match process.wait() {
                    Ok(code) => ExitStatus::Exited(code),
                    Err(error) => ExitStatus::WatchFailed(error.to_string()),
                };
                notices(SupervisorNotice::Exited(ProcessExit { handle, status }));
            })
            .map(drop)
    }

    /// Terminates the helper behind `handle`.
    ///
    /// Stale or already-killed handles are ignored, so calling this twice is
    /// harmless.
    pub fn kill(&mut self, handle: ProcessHandle) {
        if self.current != Some(handle) {
            debug!(
                target: SUPERVISOR_TARGET,
                handle = %handle,
                "ignoring kill for a handle that is not live"
            );
            return;
        }
        self.current = None;
        match self.launcher.terminate(handle.pid) {
            Ok(()) => info!(
                target: SUPERVISOR_TARGET,
                pid = handle.pid,
                "helper process terminated"
            ),
            Err(error) => warn!(
                target: SUPERVISOR_TARGET,
                pid = handle.pid,
                error = %error,
                "failed to terminate helper process"
            ),
        }
    }

    /// Interprets an exit posted by a watcher thread.
    ///
    /// Returns the unexpected exit once for the live handle. Exits of killed
    /// or superseded processes return `None`.
    pub fn on_exit(&mut self, exit: &ProcessExit) -> Option<UnexpectedExit> {
        if self.current != Some(exit.handle) {
            debug!(
                target: SUPERVISOR_TARGET,
                handle = %exit.handle,
                status = ?exit.status,
                "expected helper exit"
            );
            return None;
        }
        self.current = None;
        match &exit.status {
            ExitStatus::Exited(code) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid = exit.handle.pid,
                    code = ?code,
                    "helper process exited unexpectedly"
                );
                Some(UnexpectedExit::ProcessCrashed {
                    pid: exit.handle.pid,
                })
            }
            ExitStatus::WatchFailed(reason) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid = exit.handle.pid,
                    reason = %reason,
                    "lost watch on helper process"
                );
                Some(UnexpectedExit::LauncherLost)
            }
        }
    }

    /// Looks for a live helper recorded in the pid file of a previous run.
    ///
    /// A live stray is handed to the reaper worker, which posts
    /// [`SupervisorNotice::StaleReaped`] tagged with `session` when done.
    pub fn check_stale(&self, config: &LaunchConfig, session: u64) -> StaleCheck {
        let pid_file = config.pid_file();
        let contents = match fs::read_to_string(pid_file.as_std_path()) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return StaleCheck::Clear,
            Err(error) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    path = %pid_file,
                    error = %error,
                    "failed to read helper pid file"
                );
                return StaleCheck::Clear;
            }
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            warn!(
                target: SUPERVISOR_TARGET,
                path = %pid_file,
                "ignoring malformed helper pid file"
            );
            return StaleCheck::Clear;
        };
        if self.current.is_some_and(|handle| handle.pid == pid) {
            return StaleCheck::Clear;
        }
        match self.launcher.is_alive(pid) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    "pid file refers to a process that has already exited"
                );
                return StaleCheck::Clear;
            }
            Err(error) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    error = %error,
                    "failed to check whether the stale helper is alive"
                );
                return StaleCheck::Clear;
            }
        }
        if !self.is_stale_helper(config, pid) {
            return StaleCheck::Clear;
        }
        if !self.reaper.dispatch(session, pid) {
            warn!(
                target: SUPERVISOR_TARGET,
                pid,
                "reaper worker unavailable; launching without cleanup"
            );
            return StaleCheck::Clear;
        }
        info!(
            target: SUPERVISOR_TARGET,
            pid,
            "terminating helper left by a previous run"
        );
        StaleCheck::Reaping { pid }
    }

    /// Pids get recycled, so a live pid from the file is only signalled when
    /// its command line shows it is a helper using the same data directory.
    fn is_stale_helper(&self, config: &LaunchConfig, pid: u32) -> bool {
        match self.launcher.command_line(pid) {
            Ok(Some(command_line)) if config.matches_command_line(&command_line) => true,
            Ok(Some(command_line)) => {
                info!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    command = ?command_line,
                    "pid file refers to an unrelated process; leaving it alone"
                );
                false
            }
            Ok(None) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    "cannot confirm the stale process is a helper; leaving it alone"
                );
                false
            }
            Err(error) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    error = %error,
                    "failed to read the stale process command line"
                );
                false
            }
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("current", &self.current)
            .field("launches", &self.launches)
            .finish_non_exhaustive()
    }
}
