use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;
use url::Url;

/// Address of the helper's control port.
///
/// Configuration files may spell it as a table (`{ transport = "tcp", host =
/// "127.0.0.1", port = 9151 }`) or as a URL string. Environment variables and
/// command-line flags always carry the URL form.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ControlEndpoint {
    /// Unix domain socket endpoint.
    Unix { path: Utf8PathBuf },
    /// TCP socket endpoint.
    Tcp { host: String, port: u16 },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ControlEndpointRaw {
    Url(String),
    Table(ControlEndpointTable),
}

#[derive(Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
enum ControlEndpointTable {
    Unix { path: Utf8PathBuf },
    Tcp { host: String, port: u16 },
}

impl<'de> Deserialize<'de> for ControlEndpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match ControlEndpointRaw::deserialize(deserializer)? {
            ControlEndpointRaw::Url(text) => text.parse().map_err(de::Error::custom),
            ControlEndpointRaw::Table(ControlEndpointTable::Unix { path }) => Ok(Self::unix(path)),
            ControlEndpointRaw::Table(ControlEndpointTable::Tcp { host, port }) => {
                Ok(Self::tcp(host, port))
            }
        }
    }
}

impl ControlEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Renders the value tor expects after `--ControlPort`.
    #[must_use]
    pub fn control_port_spec(&self) -> String {
        match self {
            Self::Unix { path } => format!("unix:{path}"),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }

    /// Ensures the socket's parent directory exists with the owner-only
    /// permissions tor insists on before it will open a control socket.
    pub fn prepare_filesystem(&self) -> Result<(), EndpointPreparationError> {
        let Some(path) = self.unix_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) else {
            return Err(EndpointPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(parent.as_std_path())
            && source.kind() != std::io::ErrorKind::AlreadyExists
        {
            return Err(EndpointPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for ControlEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing a [`ControlEndpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not recognised.
    #[error("unsupported control endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Errors raised when preparing the control socket directory.
#[derive(Debug, Error)]
pub enum EndpointPreparationError {
    /// The Unix socket path has no parent directory.
    #[error("control socket path '{path}' has no parent directory")]
    MissingParent { path: Utf8PathBuf },
    /// Failed to create the socket directory.
    #[error("failed to create control socket directory '{path}': {source}")]
    CreateDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde::de::value::{Error as ValueError, MapDeserializer, StrDeserializer};

    use super::*;

    #[rstest]
    fn display_unix_endpoint() {
        let endpoint = ControlEndpoint::unix("/run/torvisor/control.sock");
        assert_eq!(endpoint.to_string(), "unix:///run/torvisor/control.sock");
    }

    #[rstest]
    fn parse_tcp_endpoint() {
        let endpoint: ControlEndpoint = "tcp://127.0.0.1:9151".parse().expect("valid endpoint");
        assert_eq!(endpoint, ControlEndpoint::tcp("127.0.0.1", 9151));
    }

    #[rstest]
    #[case("tcp://127.0.0.1", "missing TCP port")]
    #[case("http://127.0.0.1:80", "unsupported control endpoint scheme")]
    fn rejects_bad_endpoints(#[case] input: &str, #[case] fragment: &str) {
        let error = input
            .parse::<ControlEndpoint>()
            .expect_err("endpoint should be rejected");
        assert!(
            error.to_string().contains(fragment),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    #[case(ControlEndpoint::tcp("127.0.0.1", 9151), "127.0.0.1:9151")]
    #[case(ControlEndpoint::unix("/tmp/tv/control.sock"), "unix:/tmp/tv/control.sock")]
    fn renders_control_port_spec(#[case] endpoint: ControlEndpoint, #[case] expected: &str) {
        assert_eq!(endpoint.control_port_spec(), expected);
    }

    #[rstest]
    fn prepares_private_socket_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = Utf8PathBuf::from_path_buf(dir.path().join("nested").join("control.sock"))
            .expect("utf-8 temp path");
        let endpoint = ControlEndpoint::unix(socket.clone());

        endpoint.prepare_filesystem().expect("directory should be created");

        let parent = socket.parent().expect("socket has parent");
        assert!(parent.as_std_path().is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(parent.as_std_path())
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[rstest]
    fn deserialises_url_strings() {
        let input = StrDeserializer::<ValueError>::new("tcp://127.0.0.1:9351");
        let endpoint = ControlEndpoint::deserialize(input).expect("url form");
        assert_eq!(endpoint, ControlEndpoint::tcp("127.0.0.1", 9351));
    }

    #[rstest]
    fn deserialises_tables() {
        let entries = [("transport", "unix"), ("path", "/run/tv/control.sock")];
        let input = MapDeserializer::<_, ValueError>::new(entries.into_iter());
        let endpoint = ControlEndpoint::deserialize(input).expect("table form");
        assert_eq!(endpoint, ControlEndpoint::unix("/run/tv/control.sock"));
    }

    #[rstest]
    fn rejects_malformed_url_strings() {
        let input = StrDeserializer::<ValueError>::new("ftp://127.0.0.1:21");
        let error = ControlEndpoint::deserialize(input).expect_err("scheme is unsupported");
        assert!(error.to_string().contains("unsupported control endpoint scheme"));
    }

    #[rstest]
    fn tcp_endpoints_need_no_preparation() {
        ControlEndpoint::tcp("127.0.0.1", 9151)
            .prepare_filesystem()
            .expect("tcp endpoints are always ready");
    }
}
