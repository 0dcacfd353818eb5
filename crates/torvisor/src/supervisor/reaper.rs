//! Background termination of helpers left behind by a previous run.
//!
//! Terminating a stray helper may block for the whole grace period, so the
//! work happens on a dedicated worker thread. The outcome is posted back as a
//! [`SupervisorNotice::StaleReaped`] rather than awaited by the caller.

use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{NoticeSink, ProcessLauncher, SUPERVISOR_TARGET, SupervisorNotice};

/// Time a stale helper gets to exit after `SIGTERM` before it is killed.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(2);

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a stale helper was dealt with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The helper exited within the grace period.
    Terminated,
    /// The helper ignored `SIGTERM` and was killed.
    Killed,
    /// Signalling the helper failed.
    Failed(String),
}

/// Result of a stale helper termination job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleReaped {
    /// Session of the start attempt that requested the termination.
    pub session: u64,
    /// Pid read from the stale pid file.
    pub pid: u32,
    /// What happened to the process.
    pub outcome: ReapOutcome,
}

struct ReapJob {
    session: u64,
    pid: u32,
}

pub(super) struct Reaper {
    jobs: Sender<ReapJob>,
}

impl Reaper {
    pub(super) fn spawn(
        launcher: Arc<dyn ProcessLauncher>,
        notices: NoticeSink,
        grace: Duration,
    ) -> Self {
        let (jobs, queue) = mpsc::channel::<ReapJob>();
        let worker = thread::Builder::new()
            .name("torvisor-reaper".to_owned())
            .spawn(move || {
                for job in queue {
                    let outcome = reap(launcher.as_ref(), job.pid, grace);
                    debug!(
                        target: SUPERVISOR_TARGET,
                        pid = job.pid,
                        outcome = ?outcome,
                        "stale helper reaped"
                    );
                    notices(SupervisorNotice::StaleReaped(StaleReaped {
                        session: job.session,
                        pid: job.pid,
                        outcome,
                    }));
                }
            });
        if let Err(error) = worker {
            error!(
                target: SUPERVISOR_TARGET,
                error = %error,
                "failed to start reaper worker"
            );
        }
        Self { jobs }
    }

    /// Queues a termination job. Returns false when the worker is gone.
    pub(super) fn dispatch(&self, session: u64, pid: u32) -> bool {
        self.jobs.send(ReapJob { session, pid }).is_ok()
    }
}

fn reap(launcher: &dyn ProcessLauncher, pid: u32, grace: Duration) -> ReapOutcome {
    if let Err(error) = launcher.terminate(pid) {
        return ReapOutcome::Failed(error.to_string());
    }
    let deadline = Instant::now() + grace;
    loop {
        match launcher.is_alive(pid) {
            Ok(false) => return ReapOutcome::Terminated,
            Ok(true) => {}
            Err(error) => return ReapOutcome::Failed(error.to_string()),
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(REAP_POLL_INTERVAL);
    }
    warn!(
        target: SUPERVISOR_TARGET,
        pid,
        "stale helper ignored SIGTERM; killing"
    );
    match launcher.force_kill(pid) {
        Ok(()) => ReapOutcome::Killed,
        Err(error) => ReapOutcome::Failed(error.to_string()),
    }
}
