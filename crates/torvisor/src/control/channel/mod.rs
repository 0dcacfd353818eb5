//! The control channel state machine.
//!
//! The channel performs no blocking reads. Its owner feeds it lines from the
//! reader thread through [`ControlChannel::handle_line`] and acts on the
//! returned outputs. At most one command is on the wire at a time; commands
//! issued while a reply is pending wait in a queue and are written once the
//! previous reply's final line arrives.

use std::collections::VecDeque;
use std::mem;

use tracing::{debug, info, trace, warn};

use super::CONTROL_TARGET;
use super::command::{ControlCommand, InfoKey, Reply};
use super::error::ChannelError;
use super::event::{ControlEvent, EventClass, interpret_async, parse_listeners};
use super::protocol::{LineKind, ReplyLine, parse_line};
use super::transport::ControlSink;

/// Connection state of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted.
    Disconnected,
    /// Dialling or authenticating.
    Connecting,
    /// Authenticated and accepting commands.
    Ready,
    /// Closed locally or by the helper.
    Closed,
}

/// Something the channel's owner must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Authentication succeeded; the initialisation sequence is under way.
    Ready,
    /// A parsed event.
    Event(ControlEvent),
    /// The helper refused `AUTHENTICATE`; the channel is unusable.
    AuthenticationRejected(Reply),
    /// The helper refused some other command.
    CommandFailed {
        /// The refused command.
        command: ControlCommand,
        /// The error reply.
        reply: Reply,
    },
}

/// A command that was aborted by [`ControlChannel::disconnect`].
#[derive(Debug)]
pub struct AbortedCommand {
    /// The command that never completed.
    pub command: ControlCommand,
    /// Why it failed.
    pub error: ChannelError,
}

struct DataBlock {
    status: u16,
    header: String,
    body: Vec<String>,
    is_async: bool,
}

/// Client side of the helper's control protocol.
pub struct ControlChannel {
    state: ConnectionState,
    writer: Option<Box<dyn ControlSink>>,
    in_flight: Option<ControlCommand>,
    queue: VecDeque<ControlCommand>,
    reply: Vec<String>,
    data_block: Option<DataBlock>,
    subscriptions: Vec<EventClass>,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    /// Creates a disconnected channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            writer: None,
            in_flight: None,
            queue: VecDeque::new(),
            reply: Vec::new(),
            data_block: None,
            subscriptions: Vec::new(),
        }
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Event classes subscribed on this connection.
    #[must_use]
    pub fn subscriptions(&self) -> &[EventClass] {
        &self.subscriptions
    }

    /// Command awaiting its reply, if any.
    #[must_use]
    pub const fn in_flight(&self) -> Option<&ControlCommand> {
        self.in_flight.as_ref()
    }

    /// Number of commands waiting behind the in-flight one.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Marks the start of a connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnexpectedState`] unless the channel is
    /// disconnected or closed.
    pub fn begin_connect(&mut self) -> Result<(), ChannelError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed => {
                self.reset();
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            state => Err(ChannelError::UnexpectedState { state }),
        }
    }

    /// Adopts an open connection and authenticates on it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnexpectedState`] unless a connection attempt
    /// is in progress, or [`ChannelError::Io`] when `AUTHENTICATE` cannot be
    /// written.
    pub fn attach(
        &mut self,
        writer: Box<dyn ControlSink>,
        cookie: Option<Vec<u8>>,
    ) -> Result<(), ChannelError> {
        if self.state != ConnectionState::Connecting {
            return Err(ChannelError::UnexpectedState { state: self.state });
        }
        self.writer = Some(writer);
        self.write_command(ControlCommand::Authenticate { cookie })
    }

    /// Sends `command`, or queues it behind the command awaiting a reply.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] before the channel is ready and
    /// [`ChannelError::Io`] when the write fails.
    pub fn send_command(&mut self, command: ControlCommand) -> Result<(), ChannelError> {
        if self.state != ConnectionState::Ready {
            return Err(ChannelError::NotConnected);
        }
        if self.in_flight.is_some() {
            trace!(
                target: CONTROL_TARGET,
                command = %command,
                "queueing command behind in-flight request"
            );
            self.queue.push_back(command);
            return Ok(());
        }
        self.write_command(command)
    }

    /// Adds `class` to the subscribed set and sends the updated `SETEVENTS`.
    ///
    /// # Errors
    ///
    /// As for [`ControlChannel::send_command`].
    pub fn subscribe(&mut self, class: EventClass) -> Result<(), ChannelError> {
        if !self.subscriptions.contains(&class) {
            self.subscriptions.push(class);
        }
        self.send_command(ControlCommand::SetEvents(self.subscriptions.clone()))
    }

    fn write_command(&mut self, command: ControlCommand) -> Result<(), ChannelError> {
        let writer = self.writer.as_mut().ok_or(ChannelError::NotConnected)?;
        debug!(target: CONTROL_TARGET, command = %command, "sending control command");
        writer.write_all(command.encode().as_bytes())?;
        writer.flush()?;
        self.in_flight = Some(command);
        Ok(())
    }

    /// Processes one inbound line.
    ///
    /// Malformed lines are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] when writing the next queued command
    /// fails.
    pub fn handle_line(&mut self, raw: &str) -> Result<Vec<ChannelOutput>, ChannelError> {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            trace!(target: CONTROL_TARGET, "ignoring line on inactive channel");
            return Ok(Vec::new());
        }
        let trimmed = raw.trim_end_matches(['\r', '\n']);
        if self.data_block.is_some() {
            return self.handle_data_line(trimmed);
        }
        let line = match parse_line(trimmed) {
            Ok(line) => line,
            Err(error) => {
                warn!(
                    target: CONTROL_TARGET,
                    error = %error,
                    "dropping malformed control line"
                );
                return Ok(Vec::new());
            }
        };
        if line.is_async() {
            return Ok(self.handle_async(line));
        }
        self.handle_reply_line(line)
    }

    fn handle_async(&mut self, line: ReplyLine) -> Vec<ChannelOutput> {
        debug!(
            target: CONTROL_TARGET,
            status = line.status,
            line = %line.text,
            "async control line"
        );
        let mut outputs = vec![ChannelOutput::Event(ControlEvent::RawAsync(
            line.status,
            line.text.clone(),
        ))];
        if line.kind == LineKind::Data {
            self.data_block = Some(DataBlock {
                status: line.status,
                header: line.text,
                body: Vec::new(),
                is_async: true,
            });
            return outputs;
        }
        match interpret_async(&line.text) {
            Ok(Some(event)) => outputs.push(ChannelOutput::Event(event)),
            Ok(None) => {}
            Err(error) => warn!(
                target: CONTROL_TARGET,
                error = %error,
                "dropping unparseable async event"
            ),
        }
        outputs
    }

    fn handle_reply_line(&mut self, line: ReplyLine) -> Result<Vec<ChannelOutput>, ChannelError> {
        if self.in_flight.is_none() {
            warn!(
                target: CONTROL_TARGET,
                status = line.status,
                line = %line.text,
                "dropping reply with no command in flight"
            );
            return Ok(Vec::new());
        }
        match line.kind {
            LineKind::Mid => {
                debug!(
                    target: CONTROL_TARGET,
                    status = line.status,
                    line = %line.text,
                    "mid reply line"
                );
                let output =
                    ChannelOutput::Event(ControlEvent::RawMid(line.status, line.text.clone()));
                self.reply.push(line.text);
                Ok(vec![output])
            }
            LineKind::Data => {
                let output =
                    ChannelOutput::Event(ControlEvent::RawMid(line.status, line.text.clone()));
                self.data_block = Some(DataBlock {
                    status: line.status,
                    header: line.text,
                    body: Vec::new(),
                    is_async: false,
                });
                Ok(vec![output])
            }
            LineKind::End => {
                debug!(
                    target: CONTROL_TARGET,
                    status = line.status,
                    line = %line.text,
                    "end reply line"
                );
                let mut outputs = vec![ChannelOutput::Event(ControlEvent::RawEnd(
                    line.status,
                    line.text.clone(),
                ))];
                self.reply.push(line.text);
                let reply = Reply {
                    status: line.status,
                    lines: mem::take(&mut self.reply),
                };
                if let Some(command) = self.in_flight.take() {
                    outputs.extend(self.complete(command, reply)?);
                }
                if self.state == ConnectionState::Ready && self.in_flight.is_none() {
                    if let Some(next) = self.queue.pop_front() {
                        self.write_command(next)?;
                    }
                }
                Ok(outputs)
            }
        }
    }

    fn handle_data_line(&mut self, raw: &str) -> Result<Vec<ChannelOutput>, ChannelError> {
        if raw != "." {
            if let Some(block) = self.data_block.as_mut() {
                let content = raw.strip_prefix('.').filter(|rest| rest.starts_with('.'));
                block.body.push(content.unwrap_or(raw).to_owned());
            }
            return Ok(Vec::new());
        }
        let Some(block) = self.data_block.take() else {
            return Ok(Vec::new());
        };
        if block.is_async {
            debug!(
                target: CONTROL_TARGET,
                status = block.status,
                lines = block.body.len(),
                "async data block ended"
            );
        } else {
            let mut entry = block.header;
            entry.push_str(&block.body.join("\n"));
            self.reply.push(entry);
        }
        Ok(Vec::new())
    }

    fn complete(
        &mut self,
        command: ControlCommand,
        reply: Reply,
    ) -> Result<Vec<ChannelOutput>, ChannelError> {
        if !reply.is_ok() {
            return Ok(vec![self.rejected(command, reply)]);
        }
        let output = match command {
            ControlCommand::Authenticate { .. } => {
                info!(target: CONTROL_TARGET, "control channel authenticated");
                self.state = ConnectionState::Ready;
                self.initialise()?;
                ChannelOutput::Ready
            }
            ControlCommand::GetInfo(InfoKey::Version) => {
                let version = reply.value(InfoKey::Version.as_str()).unwrap_or_default();
                ChannelOutput::Event(ControlEvent::VersionReply(version.to_owned()))
            }
            ControlCommand::GetInfo(InfoKey::SocksListeners) => {
                let listeners = reply
                    .value(InfoKey::SocksListeners.as_str())
                    .map(parse_listeners)
                    .unwrap_or_default();
                ChannelOutput::Event(ControlEvent::SocksListeners(listeners))
            }
            ControlCommand::SetEvents(classes) => {
                debug!(
                    target: CONTROL_TARGET,
                    classes = ?classes,
                    "event subscription confirmed"
                );
                return Ok(Vec::new());
            }
        };
        Ok(vec![output])
    }

    fn rejected(&mut self, command: ControlCommand, reply: Reply) -> ChannelOutput {
        warn!(
            target: CONTROL_TARGET,
            command = %command,
            status = reply.status,
            reply = ?reply.lines,
            "control command rejected"
        );
        match command {
            ControlCommand::Authenticate { .. } => {
                self.close();
                ChannelOutput::AuthenticationRejected(reply)
            }
            command => ChannelOutput::CommandFailed { command, reply },
        }
    }

    /// Requests version and listeners, then subscribes to the initial event
    /// classes one at a time.
    fn initialise(&mut self) -> Result<(), ChannelError> {
        self.send_command(ControlCommand::GetInfo(InfoKey::Version))?;
        self.send_command(ControlCommand::GetInfo(InfoKey::SocksListeners))?;
        for class in EventClass::INITIAL {
            self.subscribe(class)?;
        }
        Ok(())
    }

    /// Closes the channel. The in-flight and queued commands fail with
    /// [`ChannelError::Disconnected`] and are returned.
    pub fn disconnect(&mut self) -> Vec<AbortedCommand> {
        let aborted: Vec<AbortedCommand> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .map(|command| AbortedCommand {
                command,
                error: ChannelError::Disconnected,
            })
            .collect();
        for entry in &aborted {
            debug!(
                target: CONTROL_TARGET,
                command = %entry.command,
                "command aborted by disconnect"
            );
        }
        self.close();
        aborted
    }

    /// Records that the connection ended without a local disconnect.
    ///
    /// Returns true when the loss was unexpected, which callers treat as a
    /// crash of the helper.
    pub fn connection_lost(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed => false,
            ConnectionState::Connecting | ConnectionState::Ready => {
                warn!(
                    target: CONTROL_TARGET,
                    state = ?self.state,
                    "control connection lost"
                );
                self.disconnect();
                true
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(error) = writer.shutdown() {
                trace!(
                    target: CONTROL_TARGET,
                    error = %error,
                    "control connection already closed"
                );
            }
        }
        self.reset();
        self.state = ConnectionState::Closed;
    }

    fn reset(&mut self) {
        self.in_flight = None;
        self.queue.clear();
        self.reply.clear();
        self.data_block = None;
        self.subscriptions.clear();
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .field("queued", &self.queue.len())
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}
