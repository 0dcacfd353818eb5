//! Line framing for the helper's control protocol.
//!
//! Every reply line starts with a three digit status code followed by a
//! separator: `-` for a mid-reply line, ` ` for the final line and `+` for a
//! line that opens a data block terminated by a lone `.`.

use thiserror::Error;

/// Status code the helper uses for asynchronous notifications.
pub const ASYNC_STATUS: u16 = 650;

/// Status code of a successful reply.
pub const OK_STATUS: u16 = 250;

/// Position of a line within a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `NNN-`: more lines follow.
    Mid,
    /// `NNN+`: a data block follows.
    Data,
    /// `NNN `: the reply is complete.
    End,
}

/// One framed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Three digit status code.
    pub status: u16,
    /// Position within the reply.
    pub kind: LineKind,
    /// Payload after the separator.
    pub text: String,
}

impl ReplyLine {
    /// True for asynchronous notification lines.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.status == ASYNC_STATUS
    }
}

/// Problems found while parsing control protocol input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The line is shorter than a status code and separator.
    #[error("line too short: {0:?}")]
    TooShort(String),
    /// The first three characters are not a status code.
    #[error("invalid status code in line: {0:?}")]
    InvalidStatus(String),
    /// The fourth character is not `-`, `+` or a space.
    #[error("invalid separator in line: {0:?}")]
    InvalidSeparator(String),
    /// A bootstrap notification carried no `PROGRESS=` token.
    #[error("bootstrap event without PROGRESS: {0:?}")]
    MissingProgress(String),
    /// The `PROGRESS=` value is not a percentage.
    #[error("invalid bootstrap progress {value:?}")]
    InvalidProgress {
        /// The rejected value.
        value: String,
    },
}

/// Parses one line, without its trailing line terminator.
///
/// # Errors
///
/// Returns a [`ProtocolError`] when the line is not framed as a reply line.
pub fn parse_line(line: &str) -> Result<ReplyLine, ProtocolError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let (Some(code), Some(separator), Some(text)) =
        (trimmed.get(..3), trimmed.get(3..4), trimmed.get(4..))
    else {
        return Err(ProtocolError::TooShort(trimmed.to_owned()));
    };
    if !code.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ProtocolError::InvalidStatus(trimmed.to_owned()));
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| ProtocolError::InvalidStatus(trimmed.to_owned()))?;
    let kind = match separator {
        "-" => LineKind::Mid,
        "+" => LineKind::Data,
        " " => LineKind::End,
        _ => return Err(ProtocolError::InvalidSeparator(trimmed.to_owned())),
    };
    Ok(ReplyLine {
        status,
        kind,
        text: text.to_owned(),
    })
}
