//! Lifecycle states and start outcomes.

use std::fmt;

/// Where the controller is in the helper's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// No helper is running.
    #[default]
    Idle,
    /// The helper is launching or its control channel is initialising.
    Starting,
    /// The control channel is ready.
    Running,
    /// The last run ended in a crash. Idle and retryable.
    Crashed,
}

impl LifecycleState {
    /// True when `start` will be accepted.
    #[must_use]
    pub const fn accepts_start(self) -> bool {
        matches!(self, Self::Idle | Self::Crashed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
        })
    }
}

/// Why a start request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRejection {
    /// A start attempt is already in progress.
    AlreadyStarting,
    /// The helper is already running.
    AlreadyRunning,
    /// The launch configuration is empty.
    InvalidConfig,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The attempt is under way; progress arrives as lifecycle events.
    Launching,
    /// The request was rejected without changing state.
    Rejected(StartRejection),
    /// Spawning the helper failed; the controller is idle again.
    LaunchFailed,
}
