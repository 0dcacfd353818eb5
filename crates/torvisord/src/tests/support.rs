//! Test collaborators shared by the daemon suites.

use std::ffi::OsString;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use tempfile::TempDir;

use torvisor_config::{Config, ControlEndpoint};

use crate::bootstrap::ConfigLoader;
use crate::process::{ShutdownCause, ShutdownError, ShutdownSignal};

pub const HELPER_EXECUTABLE: &str = "/opt/tor/bin/tor";

/// Loader that places the helper's data and control socket in a temporary
/// directory.
#[derive(Clone)]
pub struct TestConfigLoader {
    dir: Arc<TempDir>,
}

impl TestConfigLoader {
    pub fn new() -> Self {
        Self {
            dir: Arc::new(TempDir::new().expect("create temp dir")),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        Utf8Path::from_path(self.dir.path()).expect("temp dir should be UTF-8")
    }

    pub fn socket_dir(&self) -> Utf8PathBuf {
        self.root().join("run")
    }

    pub fn config(&self) -> Config {
        Config {
            tor_executable: Utf8PathBuf::from(HELPER_EXECUTABLE),
            data_dir: self.root().join("tor"),
            control_endpoint: ControlEndpoint::unix(self.socket_dir().join("control.sock")),
            connect_attempts: 2,
            connect_interval_ms: 1,
            ..Config::default()
        }
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config())
    }
}

/// Loader that fails by passing an invalid control endpoint flag.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load_from_iter([
            OsString::from("torvisord"),
            OsString::from("--control-endpoint"),
            OsString::from("invalid://socket"),
        ])
    }
}

/// Shutdown signal released by the test.
#[derive(Clone)]
pub struct TestShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TestShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn triggered() -> Self {
        let signal = Self::new();
        signal.trigger();
        signal
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }
}

impl ShutdownSignal for TestShutdownSignal {
    fn wait(&self) -> Result<ShutdownCause, ShutdownError> {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _released = cvar
            .wait_while(guard, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(ShutdownCause::Requested)
    }
}
