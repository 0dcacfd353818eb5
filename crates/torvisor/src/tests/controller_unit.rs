//! Unit tests for the lifecycle controller's mailbox and subscription API.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use torvisor_config::{Config, ControlEndpoint};

use crate::control::RetryPolicy;
use crate::test_support::{FakeLauncher, RecordingObserver, ScriptedConnector};
use crate::{
    ControllerGone, ControllerOptions, DEFAULT_REAP_GRACE, LaunchConfig, LifecycleController,
    LifecycleEvent, LifecycleState, StartOutcome, StartRejection,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    launcher: Arc<FakeLauncher>,
    connector: Arc<ScriptedConnector>,
    controller: LifecycleController,
}

#[fixture]
fn rig() -> Rig {
    let launcher = Arc::new(FakeLauncher::new());
    let connector = Arc::new(ScriptedConnector::new());
    let controller = LifecycleController::with_options(
        launcher.clone(),
        connector.clone(),
        ControllerOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            reap_grace: Duration::from_millis(20),
        },
    );
    Rig {
        launcher,
        connector,
        controller,
    }
}

fn launch_config() -> LaunchConfig {
    let data_dir = std::env::temp_dir().join("torvisor-controller-unit");
    LaunchConfig::new(
        "/usr/bin/tor",
        data_dir.to_string_lossy().into_owned(),
        ControlEndpoint::tcp("127.0.0.1", 9151),
    )
}

#[rstest]
fn concurrent_starts_launch_once(rig: Rig) {
    let Rig {
        launcher,
        mut controller,
        ..
    } = rig;
    let handle = controller.handle();
    let loop_thread = thread::spawn(move || controller.run());

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let caller = handle.clone();
            thread::spawn(move || caller.start_and_wait(launch_config()))
        })
        .collect();
    let mut outcomes: Vec<_> = callers
        .into_iter()
        .map(|caller| {
            caller
                .join()
                .expect("caller thread should finish")
                .expect("controller should answer")
        })
        .collect();
    outcomes.sort_by_key(|outcome| matches!(outcome, StartOutcome::Rejected(_)));

    assert_eq!(
        outcomes,
        [
            StartOutcome::Launching,
            StartOutcome::Rejected(StartRejection::AlreadyStarting)
        ]
    );
    assert_eq!(launcher.spawned().len(), 1);

    handle.shutdown().expect("controller should accept shutdown");
    loop_thread.join().expect("control loop should exit");
    assert_eq!(handle.stop(), Err(ControllerGone));
    assert!(launcher.spawned().iter().all(|pid| !launcher.is_running(*pid)));
}

#[rstest]
fn shutdown_breaks_the_control_loop(mut rig: Rig) {
    let handle = rig.controller.handle();
    handle.shutdown().expect("controller should accept shutdown");
    let flow = rig.controller.process_next(WAIT);
    assert!(flow.is_some_and(|flow| flow.is_break()));
}

#[rstest]
fn unsubscribed_observers_receive_nothing(mut rig: Rig) {
    let kept = Arc::new(RecordingObserver::new());
    let removed = Arc::new(RecordingObserver::new());
    rig.controller.subscribe(&kept);
    let id = rig.controller.subscribe(&removed);
    assert!(rig.controller.unsubscribe(id));

    rig.launcher.fail_next_spawn();
    assert_eq!(rig.controller.start(launch_config()), StartOutcome::LaunchFailed);

    assert_eq!(
        kept.events(),
        [LifecycleEvent::Launched {
            success: false,
            pid: None
        }]
    );
    assert!(removed.events().is_empty());
}

#[rstest]
fn dropped_observers_are_released(rig: Rig) {
    let observer = Arc::new(RecordingObserver::<LifecycleEvent>::new());
    rig.controller.subscribe(&observer);
    let dispatcher = rig.controller.dispatcher();
    drop(observer);
    assert_eq!(dispatcher.publish(&LifecycleEvent::LauncherCrashed), 0);
}

#[rstest]
fn connection_of_a_stopped_session_is_closed(mut rig: Rig) {
    assert_eq!(rig.controller.start(launch_config()), StartOutcome::Launching);
    let session = rig
        .connector
        .wait_for_session(1, WAIT)
        .expect("connector should open a session");
    rig.controller.stop();

    let deadline = Instant::now() + WAIT;
    while !session.is_closed() && Instant::now() < deadline {
        let _ = rig.controller.process_next(Duration::from_millis(20));
    }
    assert!(session.is_closed());
    assert!(session.written().is_empty());
    assert_eq!(rig.controller.state(), LifecycleState::Idle);
    assert_eq!(rig.controller.pid(), None);
}

#[rstest]
fn starts_with_the_configured_launch_values(mut rig: Rig) {
    let config = launch_config();
    assert_eq!(rig.controller.start(config.clone()), StartOutcome::Launching);
    assert_eq!(rig.launcher.spawn_configs(), [config]);
    assert_eq!(rig.controller.pid(), rig.launcher.spawned().first().copied());
}

#[rstest]
fn options_follow_loaded_configuration() {
    let config = Config {
        connect_attempts: 7,
        connect_interval_ms: 250,
        ..Config::default()
    };
    let options = ControllerOptions::from(&config);
    assert_eq!(
        options.retry,
        RetryPolicy::new(7, Duration::from_millis(250))
    );
    assert_eq!(options.reap_grace, DEFAULT_REAP_GRACE);
}
