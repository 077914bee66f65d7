//! Loader configuration.
//!
//! All knobs come from environment variables so an operator can change them
//! without touching the app manifest. [`LoaderConfig::from_lookup`] takes any
//! key lookup, which keeps the parsing testable without mutating the process
//! environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

/// Environment variable names.
pub mod env_vars {
    pub const PYTHON_LIB_PATH: &str = "TEN_PYTHON_LIB_PATH";
    pub const ENABLE_PYTHON_DEBUG: &str = "TEN_ENABLE_PYTHON_DEBUG";
    pub const PYTHON_DEBUG_HOST: &str = "TEN_PYTHON_DEBUG_HOST";
    pub const PYTHON_DEBUG_PORT: &str = "TEN_PYTHON_DEBUG_PORT";
    pub const LOAD_ALL_ON_INIT: &str = "TEN_PYTHON_LOAD_ALL_ON_INIT";
}

/// Default values.
pub mod defaults {
    pub const DEBUG_HOST: &str = "localhost";
    pub const DEBUG_PORT: &str = "5678";
    /// Top-level package every addon module lives under.
    pub const NAMESPACE: &str = "ten_packages";
    /// System package that ships the bridge library and the Python interface.
    pub const RUNTIME_PACKAGE: &str = "ten_runtime_python";
    /// Only literal accepted as "on" for boolean switches.
    pub const ENABLED: &str = "true";
}

/// Effective configuration of the addon loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Explicit runtime library; when set, no default candidate is tried.
    pub lib_path_override: Option<PathBuf>,
    pub debug: DebugConfig,
    /// Import every extension during init instead of on demand.
    pub load_all_on_init: bool,
    pub namespace: String,
    pub runtime_package: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            lib_path_override: None,
            debug: DebugConfig::default(),
            load_all_on_init: false,
            namespace: defaults::NAMESPACE.to_string(),
            runtime_package: defaults::RUNTIME_PACKAGE.to_string(),
        }
    }
}

impl LoaderConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // An empty override is the same as no override.
        let lib_path_override = lookup(env_vars::PYTHON_LIB_PATH)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let debug = DebugConfig {
            enabled: is_enabled(lookup(env_vars::ENABLE_PYTHON_DEBUG)),
            host: lookup(env_vars::PYTHON_DEBUG_HOST)
                .unwrap_or_else(|| defaults::DEBUG_HOST.to_string()),
            port: lookup(env_vars::PYTHON_DEBUG_PORT)
                .unwrap_or_else(|| defaults::DEBUG_PORT.to_string()),
        };

        Self {
            lib_path_override,
            debug,
            load_all_on_init: is_enabled(lookup(env_vars::LOAD_ALL_ON_INIT)),
            ..Self::default()
        }
    }

    /// Set the explicit runtime library path.
    pub fn with_lib_path_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.lib_path_override = Some(path.into());
        self
    }

    /// Set whether extensions are imported eagerly during init.
    pub fn with_load_all_on_init(mut self, load_all: bool) -> Self {
        self.load_all_on_init = load_all;
        self
    }

    /// Set the debug settings.
    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }
}

fn is_enabled(value: Option<String>) -> bool {
    value.as_deref() == Some(defaults::ENABLED)
}

/// Remote debugger settings, kept raw until [`DebugConfig::endpoint`] validates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub host: String,
    pub port: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: defaults::DEBUG_HOST.to_string(),
            port: defaults::DEBUG_PORT.to_string(),
        }
    }
}

/// A validated debugger listen address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugEndpoint {
    pub host: String,
    pub port: u16,
}

impl DebugEndpoint {
    /// Snippet that starts a debugpy listener and blocks until a client attaches.
    ///
    /// The host is embedded as a JSON string literal, which Python parses as
    /// the same string whatever quotes or backslashes it contains.
    pub fn bootstrap_snippet(&self) -> Result<String> {
        let host = serde_json::to_string(&self.host)?;
        Ok(format!(
            "import debugpy\ndebugpy.listen(({}, {}))\ndebugpy.wait_for_client()\n",
            host, self.port
        ))
    }
}

impl DebugConfig {
    /// Validated endpoint, `Ok(None)` when debugging is off.
    pub fn endpoint(&self) -> Result<Option<DebugEndpoint>> {
        if !self.enabled {
            return Ok(None);
        }

        let port = parse_debug_port(&self.port)?;
        Ok(Some(DebugEndpoint {
            host: self.host.clone(),
            port,
        }))
    }
}

/// Parse a debug port: the whole string must be a base-10 integer in `1..=65535`.
pub fn parse_debug_port(raw: &str) -> Result<u16> {
    let port: i64 = raw
        .parse()
        .map_err(|_| LoaderError::InvalidDebugConfig(format!("Invalid python debug port: {}", raw)))?;

    if !(1..=i64::from(u16::MAX)).contains(&port) {
        return Err(LoaderError::InvalidDebugConfig(format!(
            "Python debug port out of range: {}",
            raw
        )));
    }

    Ok(port as u16)
}
