//! Blocking connection plumbing for the control channel.
//!
//! Everything here runs off the control thread: the connector thread dials
//! the endpoint with retries and a reader thread turns the inbound byte
//! stream into lines. Both report back through callbacks that post onto the
//! controller's mailbox.

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use torvisor_config::ControlEndpoint;
use tracing::{debug, warn};

use super::CONTROL_TARGET;
use super::error::ChannelError;

/// Source of inbound protocol lines.
pub trait LineSource: Send {
    /// Returns the next line, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Propagates read failures from the underlying connection.
    fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Longest inbound line accepted; anything longer is discarded.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Lines that are not UTF-8 or exceed [`MAX_LINE_BYTES`] are logged and
/// skipped; only I/O failures end the stream.
impl<R: Read + Send> LineSource for BufReader<R> {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let mut raw = Vec::new();
            if self.by_ref().take(MAX_LINE_BYTES).read_until(b'\n', &mut raw)? == 0 {
                return Ok(None);
            }
            let truncated = u64::try_from(raw.len()).is_ok_and(|len| len >= MAX_LINE_BYTES);
            if truncated && !raw.ends_with(b"\n") {
                let skipped = discard_through_newline(self)?;
                warn!(
                    target: CONTROL_TARGET,
                    limit = MAX_LINE_BYTES,
                    skipped,
                    "dropping oversized control line"
                );
                continue;
            }
            match String::from_utf8(raw) {
                Ok(line) => return Ok(Some(line)),
                Err(error) => warn!(
                    target: CONTROL_TARGET,
                    line = %String::from_utf8_lossy(error.as_bytes()).trim_end(),
                    "dropping control line that is not valid UTF-8"
                ),
            }
        }
    }
}

/// Consumes input up to and including the next newline without buffering it.
fn discard_through_newline(reader: &mut impl BufRead) -> io::Result<usize> {
    let mut skipped = 0_usize;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(skipped);
        }
        let (consumed, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => (index.saturating_add(1), true),
            None => (available.len(), false),
        };
        reader.consume(consumed);
        skipped = skipped.saturating_add(consumed);
        if done {
            return Ok(skipped);
        }
    }
}

/// Outbound half of a control connection.
pub trait ControlSink: Write + Send {
    /// Closes the connection so the reader thread sees end of stream.
    ///
    /// # Errors
    ///
    /// Propagates the failure to shut the connection down.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl ControlSink for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl ControlSink for std::os::unix::net::UnixStream {
    fn shutdown(&mut self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// Both halves of an open control connection.
pub struct ControlStream {
    /// Inbound lines.
    pub reader: Box<dyn LineSource>,
    /// Outbound commands.
    pub writer: Box<dyn ControlSink>,
}

impl std::fmt::Debug for ControlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlStream").finish_non_exhaustive()
    }
}

/// Opens connections to a control endpoint.
pub trait ControlConnector: Send + Sync {
    /// Makes one connection attempt.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the failed attempt.
    fn connect(&self, endpoint: &ControlEndpoint) -> io::Result<ControlStream>;
}

/// Connector for real TCP and Unix domain socket endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl ControlConnector for SocketConnector {
    fn connect(&self, endpoint: &ControlEndpoint) -> io::Result<ControlStream> {
        match endpoint {
            ControlEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                Ok(ControlStream {
                    reader: Box::new(BufReader::new(stream.try_clone()?)),
                    writer: Box::new(stream),
                })
            }
            ControlEndpoint::Unix { path } => connect_unix(path),
        }
    }
}

#[cfg(unix)]
fn connect_unix(path: &Utf8Path) -> io::Result<ControlStream> {
    let stream = std::os::unix::net::UnixStream::connect(path.as_std_path())?;
    Ok(ControlStream {
        reader: Box::new(BufReader::new(stream.try_clone()?)),
        writer: Box::new(stream),
    })
}

#[cfg(not(unix))]
fn connect_unix(_path: &Utf8Path) -> io::Result<ControlStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix control endpoints are only supported on unix",
    ))
}

/// Bounds on how long to wait for the helper to open its control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection attempts before giving up. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Builds a retry policy.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            torvisor_config::DEFAULT_CONNECT_ATTEMPTS,
            Duration::from_millis(torvisor_config::DEFAULT_CONNECT_INTERVAL_MS),
        )
    }
}

/// An open connection plus the credentials to authenticate on it.
#[derive(Debug)]
pub struct Connection {
    /// The connection.
    pub stream: ControlStream,
    /// Authentication cookie, when the helper wrote one.
    pub cookie: Option<Vec<u8>>,
}

/// Connects to `endpoint`, retrying while the helper starts up, then reads
/// the authentication cookie.
///
/// # Errors
///
/// Returns [`ChannelError::ConnectFailed`] once every attempt has failed and
/// [`ChannelError::CookieUnavailable`] when the cookie cannot be read.
pub fn open_connection(
    connector: &dyn ControlConnector,
    endpoint: &ControlEndpoint,
    cookie_file: &Utf8Path,
    policy: RetryPolicy,
) -> Result<Connection, ChannelError> {
    let stream = connect_with_retry(connector, endpoint, policy)?;
    let cookie = read_auth_cookie(cookie_file)?;
    Ok(Connection { stream, cookie })
}

/// Dials `endpoint` until it answers or the policy is exhausted.
///
/// # Errors
///
/// Returns [`ChannelError::ConnectFailed`] carrying the last attempt's error.
pub fn connect_with_retry(
    connector: &dyn ControlConnector,
    endpoint: &ControlEndpoint,
    policy: RetryPolicy,
) -> Result<ControlStream, ChannelError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match connector.connect(endpoint) {
            Ok(stream) => {
                debug!(
                    target: CONTROL_TARGET,
                    endpoint = %endpoint,
                    attempt,
                    "connected to control endpoint"
                );
                return Ok(stream);
            }
            Err(source) if attempt >= attempts => {
                return Err(ChannelError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    attempts,
                    source,
                });
            }
            Err(error) => {
                debug!(
                    target: CONTROL_TARGET,
                    endpoint = %endpoint,
                    attempt,
                    error = %error,
                    "control endpoint not ready; retrying"
                );
                attempt += 1;
                thread::sleep(policy.interval);
            }
        }
    }
}

/// Reads the helper's control cookie. A missing file yields `None`.
///
/// # Errors
///
/// Returns [`ChannelError::CookieUnavailable`] for any other read failure.
pub fn read_auth_cookie(path: &Utf8Path) -> Result<Option<Vec<u8>>, ChannelError> {
    match fs::read(path.as_std_path()) {
        Ok(cookie) => Ok(Some(cookie)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(
                target: CONTROL_TARGET,
                path = %path,
                "no control cookie; authenticating without one"
            );
            Ok(None)
        }
        Err(source) => Err(ChannelError::CookieUnavailable {
            path: path.to_owned(),
            source,
        }),
    }
}

/// What the reader thread observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderSignal {
    /// One inbound line, terminator included.
    Line(String),
    /// The stream ended; carries the read error, if any.
    Closed(Option<String>),
}

/// Spawns a thread that forwards every line from `source` to `post`.
///
/// # Errors
///
/// Returns the error from spawning the thread.
pub fn spawn_reader<F>(mut source: Box<dyn LineSource>, post: F) -> io::Result<()>
where
    F: Fn(ReaderSignal) + Send + 'static,
{
    thread::Builder::new()
        .name("torvisor-control-reader".to_owned())
        .spawn(move || {
            loop {
                match source.next_line() {
                    Ok(Some(line)) => post(ReaderSignal::Line(line)),
                    Ok(None) => {
                        post(ReaderSignal::Closed(None));
                        break;
                    }
                    Err(error) => {
                        warn!(
                            target: CONTROL_TARGET,
                            error = %error,
                            "control connection read failed"
                        );
                        post(ReaderSignal::Closed(Some(error.to_string())));
                        break;
                    }
                }
            }
        })
        .map(drop)
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used, reason = "tests use expect for clarity")]

    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::mpsc;

    use camino::Utf8PathBuf;
    use rstest::rstest;

    use super::*;

    const MIXED_ENCODING: &[u8] = b"650 STATUS_GENERAL NOTICE \xff\xfe\r\n\
        650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n";

    #[rstest]
    fn buffered_reader_yields_lines_then_end() {
        let input = b"250 OK\r\n650 NETWORK_LIVENESS UP\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        assert_eq!(
            reader.next_line().expect("read"),
            Some("250 OK\r\n".to_owned())
        );
        assert_eq!(
            reader.next_line().expect("read"),
            Some("650 NETWORK_LIVENESS UP\r\n".to_owned())
        );
        assert_eq!(reader.next_line().expect("read"), None);
    }

    #[rstest]
    fn reader_thread_forwards_lines_and_closure() {
        let (sender, receiver) = mpsc::channel();
        let source = Box::new(BufReader::new(Cursor::new(b"250 OK\r\n".to_vec())));

        spawn_reader(source, move |signal| {
            drop(sender.send(signal));
        })
        .expect("spawn reader");

        let timeout = Duration::from_secs(5);
        assert_eq!(
            receiver.recv_timeout(timeout).expect("line"),
            ReaderSignal::Line("250 OK\r\n".to_owned())
        );
        assert_eq!(
            receiver.recv_timeout(timeout).expect("closed"),
            ReaderSignal::Closed(None)
        );
    }

    #[rstest]
    fn lines_that_are_not_utf8_are_skipped() {
        let mut reader = BufReader::new(Cursor::new(MIXED_ENCODING.to_vec()));

        assert_eq!(
            reader.next_line().expect("read"),
            Some("650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n".to_owned())
        );
        assert_eq!(reader.next_line().expect("read"), None);
    }

    #[rstest]
    fn oversized_lines_are_skipped() {
        let limit = usize::try_from(MAX_LINE_BYTES).expect("limit fits usize");
        let mut input = vec![b'x'; limit + 10];
        input.extend_from_slice(b"\r\n250 OK\r\n");
        let mut reader = BufReader::new(Cursor::new(input));

        assert_eq!(reader.next_line().expect("read"), Some("250 OK\r\n".to_owned()));
    }

    #[rstest]
    fn reader_thread_survives_invalid_utf8() {
        let (sender, receiver) = mpsc::channel();
        let source = Box::new(BufReader::new(Cursor::new(MIXED_ENCODING.to_vec())));

        spawn_reader(source, move |signal| {
            drop(sender.send(signal));
        })
        .expect("spawn reader");

        let timeout = Duration::from_secs(5);
        assert_eq!(
            receiver.recv_timeout(timeout).expect("line"),
            ReaderSignal::Line("650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n".to_owned())
        );
        assert_eq!(
            receiver.recv_timeout(timeout).expect("closed"),
            ReaderSignal::Closed(None)
        );
    }

    #[rstest]
    fn retry_gives_up_after_policy_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let endpoint = ControlEndpoint::tcp("127.0.0.1", port);

        let result = connect_with_retry(
            &SocketConnector,
            &endpoint,
            RetryPolicy::new(2, Duration::from_millis(1)),
        );

        match result {
            Err(ChannelError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[rstest]
    fn connects_to_listening_tcp_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let endpoint = ControlEndpoint::tcp("127.0.0.1", port);

        let stream = connect_with_retry(&SocketConnector, &endpoint, RetryPolicy::default());

        assert!(stream.is_ok());
    }

    #[rstest]
    fn missing_cookie_is_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("control_auth_cookie"))
            .expect("utf-8 path");

        assert_eq!(read_auth_cookie(&path).expect("read"), None);
    }

    #[rstest]
    fn cookie_bytes_are_read() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("control_auth_cookie"))
            .expect("utf-8 path");
        fs::write(&path, [1_u8, 2, 3]).expect("write cookie");

        assert_eq!(read_auth_cookie(&path).expect("read"), Some(vec![1, 2, 3]));
    }
}
