//! Composition root for the torvisor daemon.
//!
//! The daemon loads its configuration, installs structured telemetry,
//! prepares the helper's control socket directory and owns the single
//! [`torvisor::LifecycleController`]. The controller runs on the main thread
//! until a termination signal arrives; lifecycle events are logged by the
//! [`StructuredEventReporter`].

mod bootstrap;
mod process;
mod reporter;
pub mod telemetry;

pub use bootstrap::{ConfigLoader, StaticConfigLoader, SystemConfigLoader};
pub use process::{
    LaunchError, STOP_SIGNALS, ShutdownCause, ShutdownError, ShutdownSignal, SystemShutdownSignal,
    run_daemon,
};
pub use reporter::StructuredEventReporter;
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
