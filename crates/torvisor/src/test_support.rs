//! In-memory collaborators for exercising the lifecycle without spawning
//! processes or opening sockets.
//!
//! Available to this crate's tests and, through the `test-support` feature,
//! to other workspace crates.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use torvisor_config::ControlEndpoint;

use crate::LaunchConfig;
use crate::control::{ControlConnector, ControlSink, ControlStream, LineSource};
use crate::dispatcher::{Observer, ObserverError};
use crate::supervisor::{ProcessLauncher, SpawnedProcess};

const FIRST_FAKE_PID: u32 = 4000;
const FAKE_OWNER_PID: u32 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ExitSender = Sender<io::Result<Option<i32>>>;

#[derive(Default)]
struct LauncherState {
    next_pid: u32,
    spawned: Vec<u32>,
    configs: Vec<LaunchConfig>,
    terminated: Vec<u32>,
    killed: Vec<u32>,
    alive: HashSet<u32>,
    command_lines: HashMap<u32, Vec<String>>,
    stubborn: HashSet<u32>,
    fail_next: bool,
    exits: HashMap<u32, ExitSender>,
}

impl LauncherState {
    fn end(&mut self, pid: u32, status: io::Result<Option<i32>>) {
        self.alive.remove(&pid);
        self.command_lines.remove(&pid);
        if let Some(exit) = self.exits.remove(&pid) {
            // The watcher may already be gone when the supervisor was dropped.
            drop(exit.send(status));
        }
    }
}

/// A [`ProcessLauncher`] that records requests and fakes process lifetimes.
///
/// Spawned processes stay alive until the test ends them with
/// [`FakeLauncher::exit`] or the supervisor terminates them.
pub struct FakeLauncher {
    state: Mutex<LauncherState>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    /// Creates a launcher with no processes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LauncherState {
                next_pid: FIRST_FAKE_PID,
                ..LauncherState::default()
            }),
        }
    }

    /// Makes the next spawn fail with `NotFound`.
    pub fn fail_next_spawn(&self) {
        lock(&self.state).fail_next = true;
    }

    /// Pretends a process with `pid` exists whose command line is unknown.
    pub fn mark_alive(&self, pid: u32) {
        lock(&self.state).alive.insert(pid);
    }

    /// Pretends a process with `pid` runs `command_line`.
    pub fn mark_alive_as(&self, pid: u32, command_line: &[&str]) {
        let mut state = lock(&self.state);
        state.alive.insert(pid);
        state.command_lines.insert(
            pid,
            command_line.iter().map(|arg| (*arg).to_owned()).collect(),
        );
    }

    /// Pretends a helper launched from `config` by an earlier run is alive.
    pub fn mark_stray_helper(&self, pid: u32, config: &LaunchConfig) {
        let mut state = lock(&self.state);
        state.alive.insert(pid);
        state.command_lines.insert(pid, config.command_line(FAKE_OWNER_PID));
    }

    /// Makes `pid` survive `SIGTERM`.
    pub fn ignore_terminate(&self, pid: u32) {
        lock(&self.state).stubborn.insert(pid);
    }

    /// Ends a spawned process with an exit code.
    pub fn exit(&self, pid: u32, code: i32) {
        lock(&self.state).end(pid, Ok(Some(code)));
    }

    /// Makes the watcher's wait on `pid` fail.
    pub fn lose_watch(&self, pid: u32) {
        lock(&self.state).end(pid, Err(io::Error::other("wait failed")));
    }

    /// Pids of every spawned process, in order.
    #[must_use]
    pub fn spawned(&self) -> Vec<u32> {
        lock(&self.state).spawned.clone()
    }

    /// Configurations passed to each spawn.
    #[must_use]
    pub fn spawn_configs(&self) -> Vec<LaunchConfig> {
        lock(&self.state).configs.clone()
    }

    /// Pids that received `SIGTERM`.
    #[must_use]
    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.state).terminated.clone()
    }

    /// Pids that received `SIGKILL`.
    #[must_use]
    pub fn killed(&self) -> Vec<u32> {
        lock(&self.state).killed.clone()
    }

    /// Whether `pid` is currently alive.
    #[must_use]
    pub fn is_running(&self, pid: u32) -> bool {
        lock(&self.state).alive.contains(&pid)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, config: &LaunchConfig) -> io::Result<Box<dyn SpawnedProcess>> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "helper not found"));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let (exit, status) = mpsc::channel();
        state.spawned.push(pid);
        state.configs.push(config.clone());
        state.alive.insert(pid);
        state
            .command_lines
            .insert(pid, config.command_line(FAKE_OWNER_PID));
        state.exits.insert(pid, exit);
        Ok(Box::new(FakeProcess { pid, status }))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.terminated.push(pid);
        if !state.stubborn.contains(&pid) {
            state.end(pid, Ok(None));
        }
        Ok(())
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.killed.push(pid);
        state.end(pid, Ok(None));
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> io::Result<bool> {
        Ok(lock(&self.state).alive.contains(&pid))
    }

    fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>> {
        Ok(lock(&self.state).command_lines.get(&pid).cloned())
    }
}

struct FakeProcess {
    pid: u32,
    status: Receiver<io::Result<Option<i32>>>,
}

impl SpawnedProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        self.status
            .recv()
            .unwrap_or_else(|_| Err(io::Error::other("fake launcher dropped")))
    }
}

#[derive(Default)]
struct BufferState {
    bytes: Vec<u8>,
    closed: bool,
}

/// A cloneable in-memory [`ControlSink`] recording everything written.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl SharedBuffer {
    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).bytes).into_owned()
    }

    /// Written lines without their `CRLF` terminators.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Whether the owner shut the connection down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        state.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ControlSink for SharedBuffer {
    fn shutdown(&mut self) -> io::Result<()> {
        self.close();
        Ok(())
    }
}

/// The helper's side of one scripted control connection.
#[derive(Clone)]
pub struct ScriptedSession {
    lines: Sender<Option<String>>,
    buffer: SharedBuffer,
}

impl ScriptedSession {
    /// Sends a protocol line to the channel.
    pub fn send_line(&self, line: &str) {
        // The reader is gone once the channel closed; late lines are moot.
        drop(self.lines.send(Some(format!("{line}\r\n"))));
    }

    /// Closes the connection from the helper's side.
    pub fn close(&self) {
        drop(self.lines.send(None));
    }

    /// Lines the channel wrote.
    #[must_use]
    pub fn written(&self) -> Vec<String> {
        self.buffer.lines()
    }

    /// Whether the channel shut the connection down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }
}

struct ScriptedReader {
    lines: Receiver<Option<String>>,
}

impl LineSource for ScriptedReader {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.lines.recv().ok().flatten())
    }
}

/// Writer half that, like a socket shutdown, ends the reader's stream.
struct ScriptedWriter {
    buffer: SharedBuffer,
    hangup: Sender<Option<String>>,
}

impl Write for ScriptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer.flush()
    }
}

impl ControlSink for ScriptedWriter {
    fn shutdown(&mut self) -> io::Result<()> {
        self.buffer.close();
        drop(self.hangup.send(None));
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    refuse: bool,
    attempts: usize,
    sessions: Vec<ScriptedSession>,
}

/// A [`ControlConnector`] whose connections are driven by the test.
#[derive(Default)]
pub struct ScriptedConnector {
    state: Mutex<ConnectorState>,
    opened: Condvar,
}

impl ScriptedConnector {
    /// Creates a connector that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connection attempt fail until accepted again.
    pub fn refuse_connections(&self) {
        lock(&self.state).refuse = true;
    }

    /// Lets connection attempts succeed.
    pub fn accept_connections(&self) {
        lock(&self.state).refuse = false;
    }

    /// Number of connection attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    /// Number of connections opened.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// The most recently opened connection.
    #[must_use]
    pub fn latest(&self) -> Option<ScriptedSession> {
        lock(&self.state).sessions.last().cloned()
    }

    /// Waits until at least `count` connections were opened and returns the
    /// latest.
    #[must_use]
    pub fn wait_for_session(&self, count: usize, timeout: Duration) -> Option<ScriptedSession> {
        let guard = lock(&self.state);
        let (state, _) = self
            .opened
            .wait_timeout_while(guard, timeout, |state| state.sessions.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        if state.sessions.len() < count {
            return None;
        }
        state.sessions.last().cloned()
    }
}

impl ControlConnector for ScriptedConnector {
    fn connect(&self, _endpoint: &ControlEndpoint) -> io::Result<ControlStream> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.refuse {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "control port closed",
            ));
        }
        let (lines, incoming) = mpsc::channel();
        let buffer = SharedBuffer::default();
        state.sessions.push(ScriptedSession {
            lines: lines.clone(),
            buffer: buffer.clone(),
        });
        self.opened.notify_all();
        Ok(ControlStream {
            reader: Box::new(ScriptedReader { lines: incoming }),
            writer: Box::new(ScriptedWriter {
                buffer,
                hangup: lines,
            }),
        })
    }
}

/// An observer that records every event it receives.
pub struct RecordingObserver<E> {
    events: Mutex<Vec<E>>,
    arrived: Condvar,
}

impl<E> Default for RecordingObserver<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }
}

impl<E: Clone> RecordingObserver<E> {
    /// Creates an observer with no events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<E> {
        lock(&self.events).clone()
    }

    /// Waits until `predicate` holds for the received events.
    #[must_use]
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[E]) -> bool,
    {
        let guard = lock(&self.events);
        let (events, _) = self
            .arrived
            .wait_timeout_while(guard, timeout, |events| !predicate(events))
            .unwrap_or_else(PoisonError::into_inner);
        predicate(&events)
    }
}

impl<E: Clone + Send + Sync> Observer<E> for RecordingObserver<E> {
    fn notify(&self, event: &E) -> Result<(), ObserverError> {
        lock(&self.events).push(event.clone());
        self.arrived.notify_all();
        Ok(())
    }
}
