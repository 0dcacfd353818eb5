//! Lifecycle management for an external `tor` helper process.
//!
//! The crate launches the helper, watches it for crashes, terminates helpers
//! orphaned by a previous run, and drives the helper's line-based control
//! protocol. Protocol notifications are turned into typed lifecycle events
//! and fanned out to weakly held observers.
//!
//! ## Threading
//!
//! One control thread owns the [`LifecycleController`] and, through it, the
//! [`ProcessSupervisor`] and [`ControlChannel`]. Process watchers, the control
//! connector, the line reader and the stale-helper reaper run on their own
//! threads and only post [`ControlMessage`]s into the controller's mailbox.
//! Each asynchronous message carries the session of the start attempt that
//! produced it, so results arriving after a stop or crash are discarded.
//!
//! ## Events
//!
//! Collaborators see only [`LifecycleEvent`]s: launcher and process crashes,
//! launch results, bootstrap progress, circuit status and the SOCKS proxy URI.

pub mod control;
mod controller;
mod dispatcher;
mod launch_config;
mod supervisor;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use control::{ChannelError, ConnectionState, ControlChannel, ControlEvent, SocketConnector};
pub use controller::{
    ControlMessage, ControllerGone, ControllerHandle, ControllerOptions, LifecycleController,
    LifecycleEvent, LifecycleState, StartOutcome, StartRejection,
};
pub use dispatcher::{EventDispatcher, Observer, ObserverError, SubscriptionId};
pub use launch_config::LaunchConfig;
pub use supervisor::{
    DEFAULT_REAP_GRACE, ExitStatus, NoticeSink, ProcessExit, ProcessHandle, ProcessLauncher,
    ProcessSupervisor, ReapOutcome, SpawnedProcess, StaleCheck, StaleReaped, SupervisorError,
    SupervisorNotice, SystemLauncher, UnexpectedExit,
};

#[cfg(test)]
mod tests;
