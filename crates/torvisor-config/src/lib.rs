//! Shared configuration for the torvisor workspace.
//!
//! Values are layered by `ortho_config`: built-in defaults, then a TOML file
//! (`--config-path` or `TORVISOR_CONFIG_PATH`), then `TORVISOR_*` environment
//! variables, then command-line flags. The resulting [`Config`] describes how
//! to launch the helper, where its control port lives, and how the daemon
//! logs.

mod defaults;
mod endpoint;
mod logging;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL_MS, DEFAULT_CONTROL_PORT,
    DEFAULT_LOG_FILTER, DEFAULT_TOR_EXECUTABLE, default_control_endpoint, default_data_dir,
    default_log_filter, default_log_filter_string, default_log_format, default_tor_executable,
};
pub use endpoint::{ControlEndpoint, EndpointParseError, EndpointPreparationError};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved configuration shared by the daemon and its tests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "TORVISOR")]
pub struct Config {
    /// Helper executable, either a bare name resolved on `PATH` or a path.
    #[ortho_config(default = default_tor_executable())]
    pub tor_executable: Utf8PathBuf,
    /// Directory the helper keeps its state, pid file and auth cookie in.
    #[ortho_config(default = default_data_dir())]
    pub data_dir: Utf8PathBuf,
    /// Control port the helper is asked to open.
    #[ortho_config(default = default_control_endpoint())]
    pub control_endpoint: ControlEndpoint,
    /// `tracing` filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log line format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// How many times the control endpoint is probed after launch.
    #[ortho_config(default = DEFAULT_CONNECT_ATTEMPTS)]
    pub connect_attempts: u32,
    /// Delay between control endpoint probes.
    #[ortho_config(default = DEFAULT_CONNECT_INTERVAL_MS)]
    pub connect_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tor_executable: default_tor_executable(),
            data_dir: default_data_dir(),
            control_endpoint: default_control_endpoint(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Helper executable.
    #[must_use]
    pub fn tor_executable(&self) -> &Utf8Path {
        &self.tor_executable
    }

    /// Helper data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Control endpoint.
    #[must_use]
    pub fn control_endpoint(&self) -> &ControlEndpoint {
        &self.control_endpoint
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Number of control endpoint probes.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Delay between control endpoint probes.
    #[must_use]
    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn default_config_uses_builtin_values() {
        let config = Config::default();
        assert_eq!(config.tor_executable(), Utf8Path::new(DEFAULT_TOR_EXECUTABLE));
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.connect_attempts(), DEFAULT_CONNECT_ATTEMPTS);
        assert_eq!(
            config.connect_interval(),
            Duration::from_millis(DEFAULT_CONNECT_INTERVAL_MS)
        );
    }
}
