//! Error types for helper process supervision.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while launching the helper process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The launch configuration is missing required fields.
    #[error("launch configuration is empty")]
    InvalidConfig,

    /// A helper process launched by this supervisor is still live.
    #[error("helper process already running with pid {pid}")]
    AlreadyRunning {
        /// Pid of the live helper.
        pid: u32,
    },

    /// Spawning the helper or its exit watcher failed.
    #[error("failed to launch helper '{executable}': {source}")]
    LaunchFailed {
        /// Executable that was being launched.
        executable: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}
