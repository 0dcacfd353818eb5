//! Behavioural tests covering the daemon runtime.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ortho_config::OrthoError;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use torvisor::LifecycleEvent;
use torvisor::test_support::{FakeLauncher, RecordingObserver, ScriptedConnector};
use torvisor_config::Config;

use super::support::{
    FailingConfigLoader, HELPER_EXECUTABLE, TestConfigLoader, TestShutdownSignal,
};
use crate::bootstrap::ConfigLoader;
use crate::process::LaunchError;
use crate::process::launch::{LaunchPlan, ServiceDeps, run_daemon_with};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type StepResult = Result<(), String>;

#[derive(Clone)]
enum ScenarioLoader {
    Configured(TestConfigLoader),
    Failing,
}

impl ConfigLoader for ScenarioLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        match self {
            Self::Configured(loader) => loader.load(),
            Self::Failing => FailingConfigLoader.load(),
        }
    }
}

struct DaemonWorld {
    config: TestConfigLoader,
    loader: ScenarioLoader,
    launcher: Arc<FakeLauncher>,
    connector: Arc<ScriptedConnector>,
    observer: Arc<RecordingObserver<LifecycleEvent>>,
    shutdown: TestShutdownSignal,
    handle: Option<thread::JoinHandle<Result<(), LaunchError>>>,
    result: Option<Result<(), LaunchError>>,
}

impl DaemonWorld {
    fn new() -> Self {
        let config = TestConfigLoader::new();
        Self {
            loader: ScenarioLoader::Configured(config.clone()),
            config,
            launcher: Arc::new(FakeLauncher::new()),
            connector: Arc::new(ScriptedConnector::new()),
            observer: Arc::new(RecordingObserver::new()),
            shutdown: TestShutdownSignal::new(),
            handle: None,
            result: None,
        }
    }

    fn plan(
        &self,
    ) -> LaunchPlan<ScenarioLoader, RecordingObserver<LifecycleEvent>, TestShutdownSignal> {
        LaunchPlan {
            services: ServiceDeps {
                loader: self.loader.clone(),
                launcher: self.launcher.clone(),
                connector: self.connector.clone(),
                reporter: self.observer.clone(),
            },
            shutdown: self.shutdown.clone(),
        }
    }

    fn start_background(&mut self) -> StepResult {
        if self.handle.is_some() {
            return Err("daemon already running".to_owned());
        }
        let plan = self.plan();
        self.handle = Some(thread::spawn(move || run_daemon_with(plan)));
        Ok(())
    }

    fn run_foreground(&mut self) {
        self.result = Some(run_daemon_with(self.plan()));
    }

    fn join_background(&mut self) -> StepResult {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| "daemon not running".to_owned())?;
        let result = handle
            .join()
            .map_err(|_| "daemon thread panicked".to_owned())?;
        self.result = Some(result);
        Ok(())
    }

    fn wait_for_launch(&self) -> StepResult {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while self.launcher.spawned().is_empty() {
            if Instant::now() > deadline {
                return Err("daemon did not launch the helper".to_owned());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn helper_pid(&self) -> Result<u32, String> {
        self.launcher
            .spawned()
            .first()
            .copied()
            .ok_or_else(|| "no helper was launched".to_owned())
    }
}

impl Drop for DaemonWorld {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}

#[fixture]
fn world() -> RefCell<DaemonWorld> {
    RefCell::new(DaemonWorld::new())
}

#[given("a daemon configured with a scripted helper")]
fn given_configured(world: &RefCell<DaemonWorld>) {
    let _ = world;
}

#[given("a daemon whose configuration cannot load")]
fn given_failing_config(world: &RefCell<DaemonWorld>) {
    world.borrow_mut().loader = ScenarioLoader::Failing;
}

#[given("shutdown was already requested")]
fn given_shutdown_requested(world: &RefCell<DaemonWorld>) {
    world.borrow_mut().shutdown = TestShutdownSignal::triggered();
}

#[when("the daemon runs in the background")]
fn when_runs_in_background(world: &RefCell<DaemonWorld>) -> StepResult {
    let mut w = world.borrow_mut();
    w.start_background()?;
    w.wait_for_launch()
}

#[when("the daemon runs in the foreground")]
fn when_runs_in_foreground(world: &RefCell<DaemonWorld>) {
    world.borrow_mut().run_foreground();
}

#[when("the helper process exits with code {code}")]
fn when_helper_exits(world: &RefCell<DaemonWorld>, code: i32) -> StepResult {
    let w = world.borrow();
    let pid = w.helper_pid()?;
    w.launcher.exit(pid, code);
    Ok(())
}

#[when("shutdown is triggered")]
fn when_shutdown_triggered(world: &RefCell<DaemonWorld>) {
    world.borrow().shutdown.trigger();
}

#[when("the daemon run completes")]
fn when_run_completes(world: &RefCell<DaemonWorld>) -> StepResult {
    world.borrow_mut().join_background()
}

#[then("the helper is launched with the configured executable")]
fn then_configured_executable(world: &RefCell<DaemonWorld>) {
    let configs = world.borrow().launcher.spawn_configs();
    let executables: Vec<_> = configs
        .iter()
        .map(|config| config.executable().as_str())
        .collect();
    assert_eq!(executables, [HELPER_EXECUTABLE]);
}

#[then("the control socket directory exists")]
fn then_socket_dir_exists(world: &RefCell<DaemonWorld>) {
    let socket_dir = world.borrow().config.socket_dir();
    assert!(socket_dir.is_dir(), "{socket_dir} should exist");
}

#[then("the daemon run succeeds")]
fn then_run_succeeds(world: &RefCell<DaemonWorld>) {
    let w = world.borrow();
    let result = w.result.as_ref().expect("daemon result should be recorded");
    assert!(result.is_ok(), "daemon run should succeed: {result:?}");
}

#[then("the daemon run fails with a configuration error")]
fn then_run_fails_with_config_error(world: &RefCell<DaemonWorld>) {
    let w = world.borrow();
    let result = w.result.as_ref().expect("daemon result should be recorded");
    assert!(
        matches!(result, Err(LaunchError::Config { .. })),
        "unexpected result: {result:?}"
    );
}

#[then("the helper was stopped")]
fn then_helper_stopped(world: &RefCell<DaemonWorld>) -> StepResult {
    let w = world.borrow();
    let pid = w.helper_pid()?;
    if w.launcher.terminated().contains(&pid) && !w.launcher.is_running(pid) {
        Ok(())
    } else {
        Err(format!("helper {pid} was left running"))
    }
}

#[then("no helper was launched")]
fn then_no_helper(world: &RefCell<DaemonWorld>) {
    assert!(world.borrow().launcher.spawned().is_empty());
}

#[then("observers saw the helper process crash")]
fn then_helper_crashed(world: &RefCell<DaemonWorld>) -> StepResult {
    let w = world.borrow();
    let pid = w.helper_pid()?;
    let seen = w.observer.wait_for(WAIT_TIMEOUT, |events| {
        events.contains(&LifecycleEvent::ProcessCrashed { pid })
    });
    if seen {
        Ok(())
    } else {
        Err(format!("no crash reported for helper {pid}"))
    }
}

#[scenario(
    path = "tests/features/daemon.feature",
    name = "The daemon launches the configured helper and stops it on shutdown"
)]
fn launches_and_stops(world: RefCell<DaemonWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/daemon.feature",
    name = "A shutdown requested before the loop starts still stops the helper"
)]
fn early_shutdown(world: RefCell<DaemonWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/daemon.feature",
    name = "A configuration failure aborts the launch"
)]
fn configuration_failure(world: RefCell<DaemonWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/daemon.feature",
    name = "A helper crash is reported while the daemon keeps running"
)]
fn crash_is_reported(world: RefCell<DaemonWorld>) {
    drop(world);
}
