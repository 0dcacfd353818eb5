//! Commands the channel sends to the helper.

use std::fmt;

use super::event::EventClass;

/// Keys requested with `GETINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKey {
    /// `version`
    Version,
    /// `net/listeners/socks`
    SocksListeners,
}

impl InfoKey {
    /// Protocol spelling of the key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::SocksListeners => "net/listeners/socks",
        }
    }
}

/// A control protocol command.
#[derive(Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `AUTHENTICATE`, carrying the cookie when cookie authentication is on.
    Authenticate {
        /// Raw cookie bytes read from the helper's data directory.
        cookie: Option<Vec<u8>>,
    },
    /// `GETINFO <key>`
    GetInfo(InfoKey),
    /// `SETEVENTS <class>...`
    SetEvents(Vec<EventClass>),
}

impl ControlCommand {
    /// Wire form, including the trailing `CRLF`.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Authenticate { cookie: Some(cookie) } => {
                format!("AUTHENTICATE {}\r\n", hex(cookie))
            }
            Self::Authenticate { cookie: None } => "AUTHENTICATE\r\n".to_owned(),
            Self::GetInfo(key) => format!("GETINFO {}\r\n", key.as_str()),
            Self::SetEvents(classes) => {
                let mut line = "SETEVENTS".to_owned();
                for class in classes {
                    line.push(' ');
                    line.push_str(class.keyword());
                }
                line.push_str("\r\n");
                line
            }
        }
    }
}

/// Log form; the authentication cookie is never printed.
impl fmt::Debug for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticate { cookie } => f
                .debug_struct("Authenticate")
                .field("cookie", &cookie.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::GetInfo(key) => f.debug_tuple("GetInfo").field(key).finish(),
            Self::SetEvents(classes) => f.debug_tuple("SetEvents").field(classes).finish(),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticate { .. } => f.write_str("AUTHENTICATE"),
            _ => f.write_str(self.encode().trim_end()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|byte| [byte >> 4, byte & 0x0f])
        .filter_map(|nibble| char::from_digit(u32::from(nibble), 16))
        .map(|digit| digit.to_ascii_uppercase())
        .collect()
}

/// A complete reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status of the final line.
    pub status: u16,
    /// Payload of every line, data block contents included.
    pub lines: Vec<String>,
}

impl Reply {
    /// True for a `250` reply.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == super::protocol::OK_STATUS
    }

    /// Looks up `key=value` in the reply payload.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.split_once('=')
                .filter(|(name, _)| *name == key)
                .map(|(_, value)| value)
        })
    }
}
