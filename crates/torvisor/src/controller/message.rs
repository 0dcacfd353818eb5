//! The controller mailbox and the handle other threads post through.

use std::sync::mpsc::{self, Sender};

use thiserror::Error;

use super::state::StartOutcome;
use crate::LaunchConfig;
use crate::control::{ChannelError, Connection, ReaderSignal};
use crate::supervisor::SupervisorNotice;

/// A unit of work for the control thread.
///
/// Messages produced by asynchronous work carry the session of the start
/// attempt that produced them so stale results can be discarded.
#[derive(Debug)]
pub enum ControlMessage {
    /// Start the helper.
    Start {
        /// What to launch.
        config: LaunchConfig,
        /// Receives the outcome when the caller waits for it.
        reply: Option<Sender<StartOutcome>>,
    },
    /// Stop the helper.
    Stop,
    /// Stop the helper and leave the control loop.
    Shutdown,
    /// A notice from the process supervisor's worker threads.
    Supervisor(SupervisorNotice),
    /// The connector thread opened the control connection.
    Connected {
        /// Session that requested the connection.
        session: u64,
        /// The open connection.
        connection: Connection,
    },
    /// The connector thread gave up.
    ConnectFailed {
        /// Session that requested the connection.
        session: u64,
        /// Why connecting failed.
        error: ChannelError,
    },
    /// Output from the control connection's reader thread.
    Reader {
        /// Session that owns the connection.
        session: u64,
        /// What was read.
        signal: ReaderSignal,
    },
}

/// The controller's mailbox has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lifecycle controller is no longer running")]
pub struct ControllerGone;

/// Cloneable handle for driving the controller from other threads.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    sender: Sender<ControlMessage>,
}

impl ControllerHandle {
    pub(crate) const fn new(sender: Sender<ControlMessage>) -> Self {
        Self { sender }
    }

    /// Posts a start request without waiting for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerGone`] when the control loop has exited.
    pub fn start(&self, config: LaunchConfig) -> Result<(), ControllerGone> {
        self.post(ControlMessage::Start {
            config,
            reply: None,
        })
    }

    /// Posts a start request and waits for the control thread's verdict.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerGone`] when the control loop has exited or exits
    /// before answering.
    pub fn start_and_wait(&self, config: LaunchConfig) -> Result<StartOutcome, ControllerGone> {
        let (reply, outcome) = mpsc::channel();
        self.post(ControlMessage::Start {
            config,
            reply: Some(reply),
        })?;
        outcome.recv().map_err(|_| ControllerGone)
    }

    /// Posts a stop request.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerGone`] when the control loop has exited.
    pub fn stop(&self) -> Result<(), ControllerGone> {
        self.post(ControlMessage::Stop)
    }

    /// Asks the control loop to stop the helper and exit.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerGone`] when the control loop has already exited.
    pub fn shutdown(&self) -> Result<(), ControllerGone> {
        self.post(ControlMessage::Shutdown)
    }

    pub(crate) fn post(&self, message: ControlMessage) -> Result<(), ControllerGone> {
        self.sender.send(message).map_err(|_| ControllerGone)
    }
}
