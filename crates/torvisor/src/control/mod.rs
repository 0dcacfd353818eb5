//! Client for the helper's line-based control protocol.
//!
//! [`protocol`] frames lines, [`event`] interprets asynchronous
//! notifications, [`command`] encodes requests, [`channel`] holds the
//! connection state machine and [`transport`] does the blocking socket work
//! on helper threads.

pub mod channel;
pub mod command;
mod error;
pub mod event;
pub mod protocol;
pub mod transport;

pub(crate) const CONTROL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::control");

pub use self::channel::{AbortedCommand, ChannelOutput, ConnectionState, ControlChannel};
pub use self::command::{ControlCommand, InfoKey, Reply};
pub use self::error::ChannelError;
pub use self::event::{ControlEvent, EventClass, PROXY_SCHEME, interpret_async, proxy_uri};
pub use self::protocol::{LineKind, ProtocolError, ReplyLine, parse_line};
pub use self::transport::{
    Connection, ControlConnector, ControlSink, ControlStream, LineSource, ReaderSignal,
    RetryPolicy, SocketConnector, open_connection,
};
