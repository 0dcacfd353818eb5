//! Error types for the control channel.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use super::channel::ConnectionState;

/// Errors raised by the control channel and its transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The control endpoint stayed unreachable for every connect attempt.
    #[error("failed to connect to control endpoint {endpoint} after {attempts} attempts: {source}")]
    ConnectFailed {
        /// Endpoint that was dialled.
        endpoint: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: io::Error,
    },

    /// The authentication cookie exists but could not be read.
    #[error("failed to read control cookie '{path}': {source}")]
    CookieUnavailable {
        /// Cookie file location.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The channel closed while the command was pending.
    #[error("control channel disconnected")]
    Disconnected,

    /// Commands can only be sent once the channel is ready.
    #[error("control channel is not connected")]
    NotConnected,

    /// The operation is not valid in the channel's current state.
    #[error("control channel cannot do that while {state:?}")]
    UnexpectedState {
        /// State the channel was in.
        state: ConnectionState,
    },

    /// Writing to the control connection failed.
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
}
