//! Locating the Python runtime library.
//!
//! The bridge library does not link against libpython so one build works
//! with any interpreter; the interpreter library has to be mapped with global
//! symbol visibility before the bridge is loaded. Sources are tried in order:
//!
//! 1. `TEN_PYTHON_LIB_PATH`. If set, it is the only candidate: a failure is
//!    final, the operator asked for that file.
//! 2. A fixed per-platform list of Python 3.10 install locations. The first
//!    one that loads wins.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{env_vars, LoaderConfig};
use crate::error::{LoaderError, Result};
use crate::module::{LoadScope, ModuleLoader};

/// Python version the default candidates point at.
pub const DEFAULT_PYTHON_VERSION: &str = "3.10";

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    Explicit,
    Default,
}

/// One library the locator may try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeCandidate {
    pub origin: CandidateOrigin,
    pub path: PathBuf,
    pub scope: LoadScope,
}

impl RuntimeCandidate {
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            origin: CandidateOrigin::Explicit,
            path: path.into(),
            scope: LoadScope::Restricted,
        }
    }

    pub fn default_with_scope(path: impl Into<PathBuf>, scope: LoadScope) -> Self {
        Self {
            origin: CandidateOrigin::Default,
            path: path.into(),
            scope,
        }
    }
}

/// Built-in candidates for the current platform.
pub fn default_candidates() -> Vec<RuntimeCandidate> {
    #[cfg(windows)]
    {
        // Bare DLL name: only the PATH-honoring lookup can find it.
        vec![RuntimeCandidate::default_with_scope("python310.dll", LoadScope::PathSearch)]
    }

    #[cfg(target_os = "macos")]
    {
        [
            "/Library/Frameworks/Python.framework/Versions/3.10/Python",
            "/usr/local/opt/python@3.10/Frameworks/Python.framework/Versions/3.10/Python",
            "/opt/homebrew/opt/python@3.10/Frameworks/Python.framework/Versions/3.10/Python",
        ]
        .into_iter()
        .map(|p| RuntimeCandidate::default_with_scope(p, LoadScope::Restricted))
        .collect()
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        [
            "libpython3.10.so",
            "/usr/lib/x86_64-linux-gnu/libpython3.10.so",
            "/usr/lib/aarch64-linux-gnu/libpython3.10.so",
            "/usr/lib/libpython3.10.so",
        ]
        .into_iter()
        .map(|p| RuntimeCandidate::default_with_scope(p, LoadScope::Restricted))
        .collect()
    }
}

fn override_example() -> &'static str {
    if cfg!(windows) {
        "set TEN_PYTHON_LIB_PATH=C:\\Python310\\python310.dll"
    } else if cfg!(target_os = "macos") {
        "export TEN_PYTHON_LIB_PATH=/Library/Frameworks/Python.framework/Versions/3.X/Python"
    } else {
        "export TEN_PYTHON_LIB_PATH=/usr/lib/x86_64-linux-gnu/libpython3.X.so"
    }
}

/// Record of one load attempt.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAttempt {
    pub candidate: RuntimeCandidate,
    /// `None` when the candidate loaded.
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl LoadAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Every attempt made by one locate run, in order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocateReport {
    pub attempts: Vec<LoadAttempt>,
}

impl LocateReport {
    pub fn failures(&self) -> impl Iterator<Item = &LoadAttempt> {
        self.attempts.iter().filter(|a| !a.succeeded())
    }
}

/// A runtime library that loaded, with the candidate that produced it.
#[derive(Debug)]
pub struct LocatedRuntime<H> {
    pub handle: H,
    pub candidate: RuntimeCandidate,
}

/// Walks the runtime library sources in priority order.
#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    explicit: Option<PathBuf>,
    defaults: Vec<RuntimeCandidate>,
}

impl RuntimeLocator {
    /// Locator with the built-in default list.
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            defaults: default_candidates(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.lib_path_override.clone())
    }

    /// Replace the default candidate list.
    pub fn with_defaults(mut self, defaults: Vec<RuntimeCandidate>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Candidates that [`Self::locate_and_load`] would try, in order.
    pub fn candidates(&self) -> Vec<RuntimeCandidate> {
        match &self.explicit {
            Some(path) => vec![RuntimeCandidate::explicit(path.clone())],
            None => self.defaults.clone(),
        }
    }

    /// Load the first library that works.
    pub fn locate_and_load<L: ModuleLoader>(&self, loader: &L) -> Result<LocatedRuntime<L::Handle>> {
        self.locate_with_report(loader).0
    }

    /// Like [`Self::locate_and_load`], also returning every attempt made.
    pub fn locate_with_report<L: ModuleLoader>(
        &self,
        loader: &L,
    ) -> (Result<LocatedRuntime<L::Handle>>, LocateReport) {
        let mut report = LocateReport::default();

        if let Some(path) = &self.explicit {
            info!(path = %path.display(), "Using libpython from {}", env_vars::PYTHON_LIB_PATH);
            let candidate = RuntimeCandidate::explicit(path.clone());
            let result = match try_candidate(loader, &candidate, &mut report) {
                Ok(handle) => Ok(LocatedRuntime { handle, candidate }),
                Err(reason) => {
                    // No fallback: the operator named this exact file.
                    error!(path = %path.display(), %reason, "Failed to load libpython from explicit path");
                    Err(LoaderError::ExplicitOverrideFailed {
                        path: path.clone(),
                        reason,
                    })
                }
            };
            return (result, report);
        }

        info!(
            "{} not set, trying default Python {}",
            env_vars::PYTHON_LIB_PATH,
            DEFAULT_PYTHON_VERSION
        );

        for candidate in &self.defaults {
            if let Ok(handle) = try_candidate(loader, candidate, &mut report) {
                info!(path = %candidate.path.display(), "Loaded libpython (default Python {})", DEFAULT_PYTHON_VERSION);
                return (
                    Ok(LocatedRuntime {
                        handle,
                        candidate: candidate.clone(),
                    }),
                    report,
                );
            }
        }

        let message = format!(
            "Failed to load libpython. Set the {} environment variable to the path of your Python library, e.g. {}",
            env_vars::PYTHON_LIB_PATH,
            override_example()
        );
        error!("{}", message);
        (Err(LoaderError::RuntimeNotFound(message)), report)
    }
}

fn try_candidate<L: ModuleLoader>(
    loader: &L,
    candidate: &RuntimeCandidate,
    report: &mut LocateReport,
) -> std::result::Result<L::Handle, String> {
    let result = loader
        .load(&candidate.path, candidate.scope)
        .map_err(|e| e.to_string());

    if let Err(reason) = &result {
        warn!(path = %candidate.path.display(), %reason, "Runtime library candidate failed");
    }

    report.attempts.push(LoadAttempt {
        candidate: candidate.clone(),
        error: result.as_ref().err().cloned(),
        attempted_at: Utc::now(),
    });

    result
}
