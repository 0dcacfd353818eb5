//! The lifecycle state machine that ties supervision, control and fan-out
//! together.
//!
//! A single control thread owns the [`LifecycleController`]. Every other
//! thread (process watchers, the connector, the line reader, the stale-helper
//! reaper and external callers) only posts [`ControlMessage`]s into its
//! mailbox. State therefore changes in one place, without locks.

mod events;
mod message;
mod state;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use torvisor_config::Config;
use tracing::{debug, info, trace, warn};

use crate::LaunchConfig;
use crate::control::{
    ChannelError, ChannelOutput, Connection, ControlChannel, ControlConnector, ControlEvent,
    ControlStream, ReaderSignal, RetryPolicy, open_connection, transport::spawn_reader,
};
use crate::dispatcher::{EventDispatcher, Observer, SubscriptionId};
use crate::supervisor::{
    DEFAULT_REAP_GRACE, ProcessExit, ProcessHandle, ProcessLauncher, ProcessSupervisor,
    StaleCheck, StaleReaped, SupervisorNotice, UnexpectedExit,
};

pub use self::events::LifecycleEvent;
pub use self::message::{ControlMessage, ControllerGone, ControllerHandle};
pub use self::state::{LifecycleState, StartOutcome, StartRejection};

const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// Tunables for a [`LifecycleController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// How long to keep dialling the helper's control port.
    pub retry: RetryPolicy,
    /// Grace period for a stale helper between `SIGTERM` and `SIGKILL`.
    pub reap_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }
}

impl From<&Config> for ControllerOptions {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::new(config.connect_attempts(), config.connect_interval()),
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }
}

/// Orchestrates one helper process and its control channel.
pub struct LifecycleController {
    state: LifecycleState,
    session: u64,
    config: Option<LaunchConfig>,
    process: Option<ProcessHandle>,
    reaping: Option<u32>,
    supervisor: ProcessSupervisor,
    channel: ControlChannel,
    connector: Arc<dyn ControlConnector>,
    retry: RetryPolicy,
    dispatcher: Arc<EventDispatcher<LifecycleEvent>>,
    sender: Sender<ControlMessage>,
    mailbox: Receiver<ControlMessage>,
}

impl LifecycleController {
    /// Builds a controller with default options.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, connector: Arc<dyn ControlConnector>) -> Self {
        Self::with_options(launcher, connector, ControllerOptions::default())
    }

    /// Builds a controller with explicit options.
    #[must_use]
    pub fn with_options(
        launcher: Arc<dyn ProcessLauncher>,
        connector: Arc<dyn ControlConnector>,
        options: ControllerOptions,
    ) -> Self {
        let (sender, mailbox) = mpsc::channel();
        let notices = sender.clone();
        let supervisor = ProcessSupervisor::with_reap_grace(
            launcher,
            Arc::new(move |notice| {
                if notices.send(ControlMessage::Supervisor(notice)).is_err() {
                    trace!(target: LIFECYCLE_TARGET, "controller gone; dropping supervisor notice");
                }
            }),
            options.reap_grace,
        );
        Self {
            state: LifecycleState::Idle,
            session: 0,
            config: None,
            process: None,
            reaping: None,
            supervisor,
            channel: ControlChannel::new(),
            connector,
            retry: options.retry,
            dispatcher: Arc::new(EventDispatcher::new()),
            sender,
            mailbox,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Pid of the helper this controller launched, while it is live.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.map(ProcessHandle::pid)
    }

    /// Handle for posting requests from other threads.
    #[must_use]
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.sender.clone())
    }

    /// The shared event dispatcher, for subscribing from other threads.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<EventDispatcher<LifecycleEvent>> {
        Arc::clone(&self.dispatcher)
    }

    /// Subscribes an observer to lifecycle events. The observer is held
    /// weakly.
    pub fn subscribe<O>(&self, observer: &Arc<O>) -> SubscriptionId
    where
        O: Observer<LifecycleEvent> + 'static,
    {
        self.dispatcher.subscribe(observer)
    }

    /// Removes a subscription; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Begins launching the helper described by `config`.
    ///
    /// Rejections are logged and leave the state unchanged. Any helper left
    /// behind by a previous run is terminated in the background first.
    pub fn start(&mut self, config: LaunchConfig) -> StartOutcome {
        match self.state {
            LifecycleState::Starting => {
                warn!(target: LIFECYCLE_TARGET, "helper is already starting; ignoring start");
                return StartOutcome::Rejected(StartRejection::AlreadyStarting);
            }
            LifecycleState::Running => {
                warn!(
                    target: LIFECYCLE_TARGET,
                    pid = ?self.pid(),
                    "helper is already running; ignoring start"
                );
                return StartOutcome::Rejected(StartRejection::AlreadyRunning);
            }
            LifecycleState::Idle | LifecycleState::Crashed => {}
        }
        if config.is_empty() {
            warn!(target: LIFECYCLE_TARGET, "refusing to start with an empty launch configuration");
            return StartOutcome::Rejected(StartRejection::InvalidConfig);
        }

        self.session += 1;
        self.state = LifecycleState::Starting;
        info!(
            target: LIFECYCLE_TARGET,
            session = self.session,
            executable = %config.executable(),
            data_dir = %config.data_dir(),
            "starting helper"
        );
        let check = self.supervisor.check_stale(&config, self.session);
        self.config = Some(config);
        match check {
            StaleCheck::Reaping { pid } => {
                self.reaping = Some(pid);
                StartOutcome::Launching
            }
            StaleCheck::Clear => self.launch(),
        }
    }

    fn launch(&mut self) -> StartOutcome {
        let Some(config) = self.config.clone() else {
            return self.launch_failed();
        };
        match self.supervisor.launch(&config) {
            Ok(handle) => {
                self.process = Some(handle);
                self.connect(&config);
                StartOutcome::Launching
            }
            Err(error) => {
                warn!(target: LIFECYCLE_TARGET, error = %error, "failed to launch helper");
                self.launch_failed()
            }
        }
    }

    fn launch_failed(&mut self) -> StartOutcome {
        self.reset(LifecycleState::Idle);
        self.dispatcher.publish(&LifecycleEvent::Launched {
            success: false,
            pid: None,
        });
        StartOutcome::LaunchFailed
    }

    fn connect(&mut self, config: &LaunchConfig) {
        if let Err(error) = self.channel.begin_connect() {
            warn!(target: LIFECYCLE_TARGET, error = %error, "control channel not ready to connect");
            self.channel_crashed();
            return;
        }
        let Some(endpoint) = config.control_endpoint().cloned() else {
            self.channel_crashed();
            return;
        };
        let cookie_file = config.cookie_file();
        let connector = Arc::clone(&self.connector);
        let retry = self.retry;
        let session = self.session;
        let sender = self.sender.clone();
        let spawned = thread::Builder::new()
            .name("torvisor-connect".to_owned())
            .spawn(move || {
                let opened = open_connection(connector.as_ref(), &endpoint, &cookie_file, retry);
                let message = match opened {
                    Ok(connection) => ControlMessage::Connected { session, connection },
                    Err(error) => ControlMessage::ConnectFailed { session, error },
                };
                if sender.send(message).is_err() {
                    trace!(target: LIFECYCLE_TARGET, "controller gone; dropping connect result");
                }
            });
        if let Err(error) = spawned {
            warn!(target: LIFECYCLE_TARGET, error = %error, "failed to start connector thread");
            self.channel_crashed();
        }
    }

    /// Stops the helper and returns to [`LifecycleState::Idle`].
    ///
    /// Idempotent and silent: no events are published.
    pub fn stop(&mut self) {
        if self.state == LifecycleState::Idle {
            debug!(target: LIFECYCLE_TARGET, "stop requested while idle");
            return;
        }
        info!(target: LIFECYCLE_TARGET, state = %self.state, pid = ?self.pid(), "stopping helper");
        self.reset(LifecycleState::Idle);
    }

    /// Closes the channel, kills the helper and invalidates outstanding
    /// asynchronous work.
    fn reset(&mut self, state: LifecycleState) {
        self.channel.disconnect();
        if let Some(handle) = self.process.take() {
            self.supervisor.kill(handle);
        }
        self.reaping = None;
        self.config = None;
        self.session += 1;
        self.state = state;
    }

    fn crash(&mut self, event: LifecycleEvent) {
        warn!(
            target: LIFECYCLE_TARGET,
            state = %self.state,
            event = ?event,
            "helper crashed"
        );
        self.reset(LifecycleState::Crashed);
        self.dispatcher.publish(&event);
    }

    /// Channel failures are attributed to the helper when one is running.
    fn channel_crashed(&mut self) {
        let event = self
            .pid()
            .map_or(LifecycleEvent::LauncherCrashed, |pid| LifecycleEvent::ProcessCrashed { pid });
        self.crash(event);
    }

    const fn is_active(&self) -> bool {
        matches!(self.state, LifecycleState::Starting | LifecycleState::Running)
    }

    /// Handles one mailbox message.
    ///
    /// Returns [`ControlFlow::Break`] after a shutdown request.
    pub fn process_message(&mut self, message: ControlMessage) -> ControlFlow<()> {
        match message {
            ControlMessage::Start { config, reply } => {
                let outcome = self.start(config);
                if let Some(reply) = reply {
                    if reply.send(outcome).is_err() {
                        trace!(target: LIFECYCLE_TARGET, "start caller stopped waiting");
                    }
                }
            }
            ControlMessage::Stop => self.stop(),
            ControlMessage::Shutdown => {
                self.stop();
                return ControlFlow::Break(());
            }
            ControlMessage::Supervisor(SupervisorNotice::Exited(exit)) => {
                self.on_process_exit(&exit);
            }
            ControlMessage::Supervisor(SupervisorNotice::StaleReaped(reaped)) => {
                self.on_stale_reaped(&reaped);
            }
            ControlMessage::Connected {
                session,
                connection,
            } => self.on_connected(session, connection),
            ControlMessage::ConnectFailed { session, error } => {
                self.on_connect_failed(session, &error);
            }
            ControlMessage::Reader { session, signal } => self.on_reader(session, signal),
        }
        ControlFlow::Continue(())
    }

    /// Waits up to `timeout` for one message and handles it.
    ///
    /// Returns `None` when no message arrived in time.
    pub fn process_next(&mut self, timeout: Duration) -> Option<ControlFlow<()>> {
        match self.mailbox.recv_timeout(timeout) {
            Ok(message) => Some(self.process_message(message)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Runs the control loop until a shutdown request arrives.
    pub fn run(&mut self) {
        info!(target: LIFECYCLE_TARGET, "control loop running");
        while let Ok(message) = self.mailbox.recv() {
            if self.process_message(message).is_break() {
                break;
            }
        }
        info!(target: LIFECYCLE_TARGET, "control loop stopped");
    }

    fn on_process_exit(&mut self, exit: &ProcessExit) {
        let Some(unexpected) = self.supervisor.on_exit(exit) else {
            return;
        };
        if self.process != Some(exit.handle) || !self.is_active() {
            debug!(target: LIFECYCLE_TARGET, handle = %exit.handle, "exit of inactive helper");
            return;
        }
        let event = match unexpected {
            UnexpectedExit::ProcessCrashed { pid } => LifecycleEvent::ProcessCrashed { pid },
            UnexpectedExit::LauncherLost => LifecycleEvent::LauncherCrashed,
        };
        self.process = None;
        self.crash(event);
    }

    fn on_stale_reaped(&mut self, reaped: &StaleReaped) {
        if reaped.session != self.session
            || self.state != LifecycleState::Starting
            || self.reaping != Some(reaped.pid)
        {
            debug!(target: LIFECYCLE_TARGET, pid = reaped.pid, "ignoring stale reap result");
            return;
        }
        self.reaping = None;
        info!(
            target: LIFECYCLE_TARGET,
            pid = reaped.pid,
            outcome = ?reaped.outcome,
            "stale helper cleaned up; launching"
        );
        let outcome = self.launch();
        debug!(target: LIFECYCLE_TARGET, outcome = ?outcome, "deferred launch finished");
    }

    fn on_connected(&mut self, session: u64, connection: Connection) {
        let Connection { stream, cookie } = connection;
        let ControlStream { reader, mut writer } = stream;
        if session != self.session || self.state != LifecycleState::Starting {
            debug!(target: LIFECYCLE_TARGET, session, "dropping connection of a finished session");
            if let Err(error) = writer.shutdown() {
                trace!(target: LIFECYCLE_TARGET, error = %error, "stale connection already closed");
            }
            return;
        }
        if let Err(error) = self.channel.attach(writer, cookie) {
            warn!(
                target: LIFECYCLE_TARGET,
                error = %error,
                "failed to authenticate control channel"
            );
            self.channel_crashed();
            return;
        }
        let sender = self.sender.clone();
        let spawned = spawn_reader(reader, move |signal| {
            if sender.send(ControlMessage::Reader { session, signal }).is_err() {
                trace!(target: LIFECYCLE_TARGET, "controller gone; dropping control line");
            }
        });
        if let Err(error) = spawned {
            warn!(target: LIFECYCLE_TARGET, error = %error, "failed to start control reader");
            self.channel_crashed();
        }
    }

    fn on_connect_failed(&mut self, session: u64, error: &ChannelError) {
        if session != self.session || !self.is_active() {
            debug!(
                target: LIFECYCLE_TARGET,
                session,
                "ignoring connect failure of a finished session"
            );
            return;
        }
        warn!(
            target: LIFECYCLE_TARGET,
            error = %error,
            "could not reach the helper's control port"
        );
        self.channel_crashed();
    }

    fn on_reader(&mut self, session: u64, signal: ReaderSignal) {
        if session != self.session || !self.is_active() {
            trace!(
                target: LIFECYCLE_TARGET,
                session,
                "ignoring reader output of a finished session"
            );
            return;
        }
        match signal {
            ReaderSignal::Line(line) => match self.channel.handle_line(&line) {
                Ok(outputs) => {
                    for output in outputs {
                        if !self.is_active() {
                            break;
                        }
                        self.on_channel_output(output);
                    }
                }
                Err(error) => {
                    warn!(target: LIFECYCLE_TARGET, error = %error, "control channel write failed");
                    self.channel_crashed();
                }
            },
            ReaderSignal::Closed(reason) => {
                if self.channel.connection_lost() {
                    warn!(
                        target: LIFECYCLE_TARGET,
                        reason = ?reason,
                        "control connection closed by helper"
                    );
                    self.channel_crashed();
                }
            }
        }
    }

    fn on_channel_output(&mut self, output: ChannelOutput) {
        match output {
            ChannelOutput::Ready => {
                self.state = LifecycleState::Running;
                info!(target: LIFECYCLE_TARGET, pid = ?self.pid(), "helper running");
                self.dispatcher.publish(&LifecycleEvent::Launched {
                    success: true,
                    pid: self.pid(),
                });
            }
            ChannelOutput::Event(event) => self.on_control_event(&event),
            ChannelOutput::AuthenticationRejected(reply) => {
                warn!(
                    target: LIFECYCLE_TARGET,
                    status = reply.status,
                    "helper rejected authentication"
                );
                self.channel_crashed();
            }
            ChannelOutput::CommandFailed { command, reply } => debug!(
                target: LIFECYCLE_TARGET,
                command = %command,
                status = reply.status,
                "control command failed"
            ),
        }
    }

    fn on_control_event(&self, event: &ControlEvent) {
        match event {
            ControlEvent::VersionReply(version) => {
                info!(target: LIFECYCLE_TARGET, version = %version, "helper version");
            }
            ControlEvent::NetworkLiveness(up) => {
                info!(target: LIFECYCLE_TARGET, up, "helper network liveness changed");
            }
            ControlEvent::SocksListeners(listeners) if listeners.is_empty() => {
                debug!(target: LIFECYCLE_TARGET, "helper reported no SOCKS listeners");
            }
            ControlEvent::ClientStatus(status) | ControlEvent::GeneralStatus(status) => {
                debug!(target: LIFECYCLE_TARGET, status = %status, "helper status");
            }
            _ => {}
        }
        if let Some(lifecycle) = LifecycleEvent::from_control(event) {
            self.dispatcher.publish(&lifecycle);
        }
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("process", &self.process)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
