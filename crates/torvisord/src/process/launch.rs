//! Sequences daemon start-up, the control loop and shutdown.

use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use torvisor::control::ControlConnector;
use torvisor::{
    ControllerOptions, LaunchConfig, LifecycleController, LifecycleEvent, Observer,
    ProcessLauncher, SocketConnector, SystemLauncher,
};

use crate::bootstrap::{ConfigLoader, SystemConfigLoader};
use crate::reporter::StructuredEventReporter;
use crate::telemetry;

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::shutdown::{ShutdownSignal, SystemShutdownSignal};

/// Collaborators that reach outside the process.
pub(crate) struct ServiceDeps<L, R> {
    pub(crate) loader: L,
    pub(crate) launcher: Arc<dyn ProcessLauncher>,
    pub(crate) connector: Arc<dyn ControlConnector>,
    pub(crate) reporter: Arc<R>,
}

/// Collaborators required to run the daemon.
pub(crate) struct LaunchPlan<L, R, S> {
    pub(crate) services: ServiceDeps<L, R>,
    pub(crate) shutdown: S,
}

/// Runs the daemon using the production collaborators.
///
/// # Errors
///
/// Returns [`LaunchError`] when configuration, telemetry, socket preparation
/// or signal handling fails.
pub fn run_daemon() -> Result<(), LaunchError> {
    let plan = LaunchPlan {
        services: ServiceDeps {
            loader: SystemConfigLoader,
            launcher: Arc::new(SystemLauncher::new()),
            connector: Arc::new(SocketConnector),
            reporter: Arc::new(StructuredEventReporter::new()),
        },
        shutdown: SystemShutdownSignal::new(),
    };
    run_daemon_with(plan)
}

/// Runs the daemon with injected collaborators.
///
/// The helper is started once; a crash leaves the controller idle until the
/// daemon is restarted. The shutdown watcher posts a shutdown request, which
/// stops the helper and ends the control loop.
pub(crate) fn run_daemon_with<L, R, S>(plan: LaunchPlan<L, R, S>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    R: Observer<LifecycleEvent> + 'static,
    S: ShutdownSignal + 'static,
{
    let LaunchPlan { services, shutdown } = plan;
    let ServiceDeps {
        loader,
        launcher,
        connector,
        reporter,
    } = services;

    let config = loader.load()?;
    let telemetry = telemetry::initialise(&config)?;
    info!(
        target: PROCESS_TARGET,
        log_format = %telemetry.format(),
        log_filter = telemetry.filter(),
        executable = %config.tor_executable(),
        data_dir = %config.data_dir(),
        control = %config.control_endpoint(),
        "starting daemon runtime"
    );
    config.control_endpoint().prepare_filesystem()?;

    let mut controller =
        LifecycleController::with_options(launcher, connector, ControllerOptions::from(&config));
    controller.subscribe(&reporter);
    let outcome = controller.start(LaunchConfig::from(&config));
    info!(target: PROCESS_TARGET, outcome = ?outcome, "helper start requested");

    let handle = controller.handle();
    let watcher = thread::Builder::new()
        .name("torvisord-shutdown".to_owned())
        .spawn(move || {
            let waited = shutdown.wait();
            if let Err(error) = &waited {
                warn!(target: PROCESS_TARGET, error = %error, "shutdown listener failed");
            }
            if handle.shutdown().is_err() {
                warn!(target: PROCESS_TARGET, "control loop exited before shutdown");
            }
            waited
        })
        .map_err(|source| LaunchError::Watcher { source })?;

    controller.run();
    let cause = watcher.join().map_err(|_| LaunchError::WatcherPanicked)??;
    info!(target: PROCESS_TARGET, cause = %cause, "shutdown sequence completed");
    Ok(())
}
