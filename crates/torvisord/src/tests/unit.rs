//! Unit tests for the daemon's loaders and launch errors.

use std::sync::Arc;

use rstest::rstest;

use torvisor::test_support::{FakeLauncher, ScriptedConnector};
use torvisor_config::{Config, ControlEndpoint};

use super::support::{FailingConfigLoader, TestConfigLoader, TestShutdownSignal};
use crate::bootstrap::{ConfigLoader, StaticConfigLoader};
use crate::process::LaunchError;
use crate::process::launch::{LaunchPlan, ServiceDeps, run_daemon_with};
use crate::reporter::StructuredEventReporter;

#[rstest]
fn static_loader_returns_its_configuration() {
    let config = TestConfigLoader::new().config();
    let loader = StaticConfigLoader::new(config.clone());
    assert_eq!(loader.load().expect("static load"), config);
}

#[rstest]
fn command_line_endpoint_is_validated_on_load() {
    let error = FailingConfigLoader
        .load()
        .expect_err("unsupported scheme should be rejected");
    assert!(
        error.to_string().contains("invalid"),
        "unexpected error: {error}"
    );
}

#[rstest]
fn socket_without_parent_is_rejected_before_launch() {
    let config = Config {
        control_endpoint: ControlEndpoint::unix("control.sock"),
        ..TestConfigLoader::new().config()
    };
    let launcher = Arc::new(FakeLauncher::new());
    let plan = LaunchPlan {
        services: ServiceDeps {
            loader: StaticConfigLoader::new(config),
            launcher: launcher.clone(),
            connector: Arc::new(ScriptedConnector::new()),
            reporter: Arc::new(StructuredEventReporter::new()),
        },
        shutdown: TestShutdownSignal::triggered(),
    };

    let error = run_daemon_with(plan).expect_err("socket preparation should fail");
    assert!(matches!(error, LaunchError::Socket { .. }));
    assert!(error.to_string().contains("control.sock"));
    assert!(launcher.spawned().is_empty());
}

#[rstest]
fn launch_errors_describe_their_cause() {
    let error = LaunchError::WatcherPanicked;
    assert_eq!(error.to_string(), "shutdown watcher panicked");
}
