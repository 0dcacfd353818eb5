//! Error surface for daemon launch and shutdown.

use std::io;
use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

use torvisor_config::EndpointPreparationError;

use super::shutdown::ShutdownError;
use crate::telemetry::TelemetryError;

/// Errors surfaced while launching or stopping the daemon.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// Preparing the control socket directory failed.
    #[error("failed to prepare control socket: {source}")]
    Socket {
        /// Underlying filesystem error.
        #[source]
        source: EndpointPreparationError,
    },
    /// The shutdown watcher thread could not be started.
    #[error("failed to start shutdown watcher: {source}")]
    Watcher {
        /// Underlying thread spawn error.
        #[source]
        source: io::Error,
    },
    /// The shutdown watcher thread panicked.
    #[error("shutdown watcher panicked")]
    WatcherPanicked,
    /// Waiting for shutdown failed.
    #[error("failed to await shutdown signal: {source}")]
    Shutdown {
        /// Underlying shutdown error.
        #[source]
        source: ShutdownError,
    },
}

impl From<Arc<OrthoError>> for LaunchError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config { source }
    }
}

impl From<TelemetryError> for LaunchError {
    fn from(source: TelemetryError) -> Self {
        Self::Telemetry { source }
    }
}

impl From<EndpointPreparationError> for LaunchError {
    fn from(source: EndpointPreparationError) -> Self {
        Self::Socket { source }
    }
}

impl From<ShutdownError> for LaunchError {
    fn from(source: ShutdownError) -> Self {
        Self::Shutdown { source }
    }
}
