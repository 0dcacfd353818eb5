//! Typed events parsed from the control protocol.

use std::fmt;

use super::protocol::ProtocolError;

/// Scheme prefixed to the helper's SOCKS listener to form a proxy URI.
pub const PROXY_SCHEME: &str = "socks5://";

const PROGRESS_PREFIX: &str = "PROGRESS=";

/// Asynchronous event classes the channel subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// `NETWORK_LIVENESS`: whether the helper believes the network is up.
    NetworkLiveness,
    /// `STATUS_CLIENT`: bootstrap and circuit status.
    StatusClient,
    /// `STATUS_GENERAL`: general helper status.
    StatusGeneral,
}

impl EventClass {
    /// Classes subscribed once the channel is ready.
    pub const INITIAL: [Self; 3] = [
        Self::NetworkLiveness,
        Self::StatusClient,
        Self::StatusGeneral,
    ];

    /// Protocol keyword for the class.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::NetworkLiveness => "NETWORK_LIVENESS",
            Self::StatusClient => "STATUS_CLIENT",
            Self::StatusGeneral => "STATUS_GENERAL",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        Self::INITIAL
            .into_iter()
            .find(|class| class.keyword() == keyword)
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// An event produced by the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Reply to `GETINFO version`.
    VersionReply(String),
    /// Reply to `GETINFO net/listeners/socks`, as raw listener strings.
    SocksListeners(Vec<String>),
    /// Bootstrap percentage from a `STATUS_CLIENT BOOTSTRAP` event.
    BootstrapProgress(u8),
    /// Circuit establishment reported by `STATUS_CLIENT`.
    CircuitEstablished(bool),
    /// `NETWORK_LIVENESS UP` or `DOWN`.
    NetworkLiveness(bool),
    /// Any other `STATUS_CLIENT` payload.
    ClientStatus(String),
    /// A `STATUS_GENERAL` payload.
    GeneralStatus(String),
    /// An unsolicited line, before interpretation.
    RawAsync(u16, String),
    /// A mid-reply line of a command reply.
    RawMid(u16, String),
    /// The final line of a command reply.
    RawEnd(u16, String),
}

/// Interprets the payload of an asynchronous (`650`) line.
///
/// Returns `Ok(None)` for classes and payloads that carry no typed event.
///
/// # Errors
///
/// A `BOOTSTRAP` status without a valid `PROGRESS=` percentage is reported as
/// a [`ProtocolError`] so the caller can log and drop it.
pub fn interpret_async(text: &str) -> Result<Option<ControlEvent>, ProtocolError> {
    let (keyword, payload) = text.split_once(' ').unwrap_or((text, ""));
    let Some(class) = EventClass::from_keyword(keyword) else {
        return Ok(None);
    };
    let event = match class {
        EventClass::StatusClient => interpret_client_status(payload)?,
        EventClass::StatusGeneral => ControlEvent::GeneralStatus(payload.to_owned()),
        EventClass::NetworkLiveness => match payload.split_whitespace().next() {
            Some("UP") => ControlEvent::NetworkLiveness(true),
            Some("DOWN") => ControlEvent::NetworkLiveness(false),
            _ => return Ok(None),
        },
    };
    Ok(Some(event))
}

fn interpret_client_status(payload: &str) -> Result<ControlEvent, ProtocolError> {
    let mut tokens = payload.split_whitespace();
    if tokens.clone().any(|token| token == "BOOTSTRAP") {
        return bootstrap_progress(payload).map(ControlEvent::BootstrapProgress);
    }
    if tokens.clone().any(|token| token == "CIRCUIT_ESTABLISHED") {
        return Ok(ControlEvent::CircuitEstablished(true));
    }
    if tokens.any(|token| token == "CIRCUIT_NOT_ESTABLISHED") {
        return Ok(ControlEvent::CircuitEstablished(false));
    }
    Ok(ControlEvent::ClientStatus(payload.to_owned()))
}

/// Reads the percentage after `PROGRESS=` up to the next space.
fn bootstrap_progress(payload: &str) -> Result<u8, ProtocolError> {
    let Some((_, rest)) = payload.split_once(PROGRESS_PREFIX) else {
        return Err(ProtocolError::MissingProgress(payload.to_owned()));
    };
    let value = rest.split(' ').next().unwrap_or_default();
    match value.parse::<u8>() {
        Ok(percent) if percent <= 100 => Ok(percent),
        _ => Err(ProtocolError::InvalidProgress {
            value: value.to_owned(),
        }),
    }
}

/// Splits a `net/listeners/socks` value into its raw listener strings.
#[must_use]
pub fn parse_listeners(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_owned).collect()
}

/// Derives the proxy URI from the first listener, with quotes removed.
///
/// Returns `None` for an empty listener list.
#[must_use]
pub fn proxy_uri(listeners: &[String]) -> Option<String> {
    let first = listeners.first()?;
    let address = first.replace('"', "");
    if address.is_empty() {
        return None;
    }
    Some(format!("{PROXY_SCHEME}{address}"))
}
