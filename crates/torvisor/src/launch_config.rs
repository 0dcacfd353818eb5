//! Immutable description of how to start the helper process.

use camino::{Utf8Path, Utf8PathBuf};

use torvisor_config::{Config, ControlEndpoint};

const PID_FILE_NAME: &str = "tor.pid";
const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Everything needed to launch the helper and reach its control port.
///
/// A default-constructed value is *empty* and is rejected by
/// [`crate::LifecycleController::start`] and
/// [`crate::ProcessSupervisor::launch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    executable: Utf8PathBuf,
    data_dir: Utf8PathBuf,
    control_endpoint: Option<ControlEndpoint>,
}

impl LaunchConfig {
    /// Builds a launch configuration.
    #[must_use]
    pub fn new(
        executable: impl Into<Utf8PathBuf>,
        data_dir: impl Into<Utf8PathBuf>,
        control_endpoint: ControlEndpoint,
    ) -> Self {
        Self {
            executable: executable.into(),
            data_dir: data_dir.into(),
            control_endpoint: Some(control_endpoint),
        }
    }

    /// Returns true when any required field is missing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executable.as_str().is_empty()
            || self.data_dir.as_str().is_empty()
            || self.control_endpoint.is_none()
    }

    /// Helper executable.
    #[must_use]
    pub fn executable(&self) -> &Utf8Path {
        &self.executable
    }

    /// Helper data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    /// Control endpoint, absent only on an empty configuration.
    #[must_use]
    pub fn control_endpoint(&self) -> Option<&ControlEndpoint> {
        self.control_endpoint.as_ref()
    }

    /// File the helper records its pid in.
    #[must_use]
    pub fn pid_file(&self) -> Utf8PathBuf {
        self.data_dir.join(PID_FILE_NAME)
    }

    /// File the helper writes its control authentication cookie to.
    #[must_use]
    pub fn cookie_file(&self) -> Utf8PathBuf {
        self.data_dir.join(COOKIE_FILE_NAME)
    }

    /// Command-line arguments for the helper.
    ///
    /// `owner_pid` is passed as `__OwningControllerProcess` so the helper
    /// exits on its own when the supervising process disappears.
    #[must_use]
    pub fn helper_arguments(&self, owner_pid: u32) -> Vec<String> {
        let mut args = vec![
            "--ignore-missing-torrc".to_owned(),
            "--DataDirectory".to_owned(),
            self.data_dir.to_string(),
        ];
        if let Some(endpoint) = &self.control_endpoint {
            args.push("--ControlPort".to_owned());
            args.push(endpoint.control_port_spec());
        }
        args.extend([
            "--CookieAuthentication".to_owned(),
            "1".to_owned(),
            "--SocksPort".to_owned(),
            "auto".to_owned(),
            "--PidFile".to_owned(),
            self.pid_file().to_string(),
            "--__OwningControllerProcess".to_owned(),
            owner_pid.to_string(),
        ]);
        args
    }

    /// Full argument vector of a helper launched from this configuration,
    /// program first.
    #[must_use]
    pub fn command_line(&self, owner_pid: u32) -> Vec<String> {
        let mut command_line = vec![self.executable.to_string()];
        command_line.extend(self.helper_arguments(owner_pid));
        command_line
    }

    /// Whether a running process with this argument vector is a helper that
    /// was launched from this configuration.
    ///
    /// The program must share the executable's file name and the arguments
    /// must name the same data directory.
    #[must_use]
    pub fn matches_command_line(&self, command_line: &[String]) -> bool {
        let Some(program) = command_line.first() else {
            return false;
        };
        if Utf8Path::new(program).file_name() != self.executable.file_name() {
            return false;
        }
        let data_dir = self.data_dir.as_str();
        command_line.windows(2).any(|pair| match pair {
            [flag, value] => flag == "--DataDirectory" && value == data_dir,
            _ => false,
        })
    }
}

impl From<&Config> for LaunchConfig {
    fn from(config: &Config) -> Self {
        Self::new(
            config.tor_executable(),
            config.data_dir(),
            config.control_endpoint().clone(),
        )
    }
}
