use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

use dirs::data_local_dir;
#[cfg(unix)]
use dirs::runtime_dir;

use crate::endpoint::ControlEndpoint;

/// TCP control port used when Unix domain sockets are not available.
pub const DEFAULT_CONTROL_PORT: u16 = 9151;

/// Helper executable looked up on `PATH` when nothing else is configured.
pub const DEFAULT_TOR_EXECUTABLE: &str = "tor";

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Number of times the control endpoint is probed after launching the helper.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 50;

/// Delay between control endpoint probes, in milliseconds.
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 100;

const NAMESPACE: &str = "torvisor";

/// Default log filter expression used by the binaries.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Default helper executable.
#[must_use]
pub fn default_tor_executable() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_TOR_EXECUTABLE)
}

/// Directory handed to the helper as its `DataDirectory`.
#[must_use]
pub fn default_data_dir() -> Utf8PathBuf {
    let mut base = data_local_dir()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(fallback_base_directory);
    base.push(NAMESPACE);
    base.push("tor");
    base
}

/// Computes the default control endpoint for the helper.
#[must_use]
pub fn default_control_endpoint() -> ControlEndpoint {
    default_control_endpoint_inner()
}

#[cfg(unix)]
fn default_control_endpoint_inner() -> ControlEndpoint {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push(NAMESPACE);
    if apply_namespace {
        base.push(user_namespace());
    }

    ControlEndpoint::unix(base.join("control.sock"))
}

#[cfg(not(unix))]
fn default_control_endpoint_inner() -> ControlEndpoint {
    ControlEndpoint::tcp("127.0.0.1", DEFAULT_CONTROL_PORT)
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    // SAFETY: `geteuid` has no preconditions and cannot fail.
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}
