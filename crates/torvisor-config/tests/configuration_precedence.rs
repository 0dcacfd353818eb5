//! Behavioural coverage for configuration layering.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use torvisor_config::{
    Config, ControlEndpoint, DEFAULT_CONNECT_ATTEMPTS, default_control_endpoint,
    default_log_filter, default_log_format, default_tor_executable,
};

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Harness {
    temp_dir: TempDir,
    cli_args: RefCell<Vec<OsString>>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    env_guard: RefCell<Option<MutexGuard<'static, ()>>>,
    loaded: RefCell<Option<Config>>,
    error: RefCell<Option<String>>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("failed to create temporary directory: {error}"),
        };
        Self {
            temp_dir,
            cli_args: RefCell::new(vec![OsString::from("torvisord")]),
            env_overrides: RefCell::new(Vec::new()),
            env_guard: RefCell::new(None),
            loaded: RefCell::new(None),
            error: RefCell::new(None),
        }
    }

    fn write_config(&self, endpoint: &ControlEndpoint) {
        let toml = match endpoint {
            ControlEndpoint::Unix { path } => {
                format!("control_endpoint = {{ transport = \"unix\", path = \"{path}\" }}\n")
            }
            ControlEndpoint::Tcp { host, port } => format!(
                "control_endpoint = {{ transport = \"tcp\", host = \"{host}\", port = {port} }}\n"
            ),
        };
        self.write_config_toml(&toml);
    }

    fn write_config_toml(&self, toml: &str) {
        let path = self.temp_dir.path().join("torvisor.toml");
        if let Err(error) = fs::write(&path, toml) {
            panic!("failed to write configuration: {error}");
        }

        let mut args = self.cli_args.borrow_mut();
        args.push(OsString::from("--config-path"));
        args.push(path.into_os_string());
    }

    fn set_env(&self, key: &str, value: &str) {
        if self.env_guard.borrow().is_none() {
            let guard = ENV_MUTEX
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *self.env_guard.borrow_mut() = Some(guard);
        }
        let previous = std::env::var_os(key);
        // Environment mutation is `unsafe` in edition 2024; overrides are
        // serialised by `ENV_MUTEX` and restored in `Drop`.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn push_cli_arg(&self, arg: impl Into<OsString>) {
        self.cli_args.borrow_mut().push(arg.into());
    }

    fn load(&self) {
        if self.loaded.borrow().is_some() || self.error.borrow().is_some() {
            return;
        }

        let args = self.cli_args.borrow().clone();
        match Config::load_from_iter(args) {
            Ok(config) => {
                *self.loaded.borrow_mut() = Some(config);
            }
            Err(error) => {
                *self.error.borrow_mut() = Some(error.to_string());
            }
        }
    }

    fn with_loaded<R>(&self, check: impl FnOnce(&Config) -> R) -> R {
        self.load();

        if let Some(error) = self.error.borrow().as_ref() {
            panic!("configuration failed to load: {error}");
        }

        let loaded = self.loaded.borrow();
        match loaded.as_ref() {
            Some(config) => check(config),
            None => panic!("configuration was not loaded"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            if let Some(os_value) = value {
                unsafe { std::env::set_var(&key, os_value) };
            } else {
                unsafe { std::env::remove_var(&key) };
            }
        }
        drop(self.env_guard.borrow_mut().take());
    }
}

fn parse_endpoint(endpoint: &str) -> ControlEndpoint {
    match endpoint.parse::<ControlEndpoint>() {
        Ok(parsed) => parsed,
        Err(error) => panic!("invalid endpoint '{endpoint}': {error}"),
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the control endpoint to \"{endpoint}\"")]
fn given_configuration_file(harness: &Harness, endpoint: String) {
    harness.write_config(&parse_endpoint(&endpoint));
}

#[given("a configuration file spelling the control endpoint as \"{endpoint}\"")]
fn given_configuration_file_url(harness: &Harness, endpoint: String) {
    harness.write_config_toml(&format!("control_endpoint = \"{endpoint}\"\n"));
}

#[given("the environment overrides the control endpoint to \"{endpoint}\"")]
fn given_environment_override(harness: &Harness, endpoint: String) {
    harness.set_env("TORVISOR_CONTROL_ENDPOINT", &endpoint);
}

#[when("the CLI sets the control endpoint to \"{endpoint}\"")]
fn when_cli_override(harness: &Harness, endpoint: String) {
    harness.push_cli_arg("--control-endpoint");
    harness.push_cli_arg(OsString::from(&endpoint));
}

#[when("the configuration loads without overrides")]
fn when_load_without_overrides(harness: &Harness) {
    harness.load();
}

#[then("loading the configuration resolves the control endpoint to \"{endpoint}\"")]
fn then_resolved_endpoint(harness: &Harness, endpoint: String) {
    let expected = parse_endpoint(&endpoint);
    harness.with_loaded(|config| assert_eq!(config.control_endpoint(), &expected));
}

#[then("loading the configuration applies the built-in defaults")]
fn then_defaults_applied(harness: &Harness) {
    harness.with_loaded(|config| {
        assert_eq!(config.control_endpoint(), &default_control_endpoint());
        assert_eq!(config.tor_executable(), default_tor_executable().as_path());
        assert_eq!(config.log_filter(), default_log_filter());
        assert_eq!(config.log_format(), default_log_format());
        assert_eq!(config.connect_attempts(), DEFAULT_CONNECT_ATTEMPTS);
    });
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Built-in defaults apply when nothing is overridden"
)]
fn defaults_apply(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Configuration file overrides the defaults"
)]
fn file_overrides_defaults(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Environment overrides the configuration file"
)]
fn environment_overrides_file(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Command line overrides the environment"
)]
fn cli_overrides_environment(#[from(harness)] harness: Harness) {
    drop(harness);
}

#[scenario(
    path = "tests/features/configuration_precedence.feature",
    name = "Configuration file may spell the endpoint as a URL"
)]
fn file_accepts_url_endpoint(#[from(harness)] harness: Harness) {
    drop(harness);
}
