//! Structured logging of lifecycle events.

use torvisor::{LifecycleEvent, Observer, ObserverError};

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// Observer that records every lifecycle event using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredEventReporter;

impl StructuredEventReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Observer<LifecycleEvent> for StructuredEventReporter {
    fn notify(&self, event: &LifecycleEvent) -> Result<(), ObserverError> {
        match event {
            LifecycleEvent::LauncherCrashed => tracing::error!(
                target: EVENTS_TARGET,
                event = "launcher_crashed",
                "lost track of the helper process"
            ),
            LifecycleEvent::ProcessCrashed { pid } => tracing::error!(
                target: EVENTS_TARGET,
                event = "process_crashed",
                pid,
                "helper process crashed"
            ),
            LifecycleEvent::Launched { success: true, pid } => tracing::info!(
                target: EVENTS_TARGET,
                event = "launched",
                pid = ?pid,
                "helper launched"
            ),
            LifecycleEvent::Launched { success: false, .. } => tracing::error!(
                target: EVENTS_TARGET,
                event = "launch_failed",
                "helper failed to launch"
            ),
            LifecycleEvent::Initializing { progress } => tracing::info!(
                target: EVENTS_TARGET,
                event = "initializing",
                progress,
                "helper bootstrapping"
            ),
            LifecycleEvent::CircuitEstablished(established) => tracing::info!(
                target: EVENTS_TARGET,
                event = "circuit_established",
                established,
                "helper circuit status changed"
            ),
            LifecycleEvent::NewProxyUri(uri) => tracing::info!(
                target: EVENTS_TARGET,
                event = "new_proxy_uri",
                uri = %uri,
                "helper proxy available"
            ),
        }
        Ok(())
    }
}
