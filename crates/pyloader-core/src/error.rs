//! Error handling for the Python addon loader.
//!
//! Every fallible operation in the crate returns [`Result`]. Whether an error
//! aborts the init sequence or is only logged is decided by the caller; the
//! variant docs below state the policy used by the lifecycle manager and the
//! locator.

use std::path::PathBuf;

/// Errors raised while loading, binding or driving the embedded runtime.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// A single library candidate failed to load.
    ///
    /// Non-fatal while walking the default candidate list.
    #[error("Failed to load library {}: {reason}", path.display())]
    LibraryNotFound { path: PathBuf, reason: String },

    /// The operator-provided runtime library could not be loaded.
    ///
    /// Terminal: an explicit override never falls back to defaults.
    #[error("Failed to load runtime library from explicit override {}: {reason}", path.display())]
    ExplicitOverrideFailed { path: PathBuf, reason: String },

    /// None of the default runtime library candidates could be loaded.
    #[error("Runtime library not found: {0}")]
    RuntimeNotFound(String),

    /// The bridge library next to this module could not be loaded.
    #[error("Failed to load bridge library {}: {reason}", path.display())]
    BridgeNotFound { path: PathBuf, reason: String },

    /// The path of this module, or a path derived from it, could not be resolved.
    #[error("Module path error: {0}")]
    ModulePath(String),

    /// Closing a library handle failed.
    #[error("Failed to close library: {0}")]
    LibraryClose(String),

    /// A required bridge entry point is missing.
    #[error("Failed to load symbol: {0}")]
    SymbolUnresolved(String),

    /// The remote debug settings are malformed.
    #[error("Invalid debug configuration: {0}")]
    InvalidDebugConfig(String),

    /// The extension directory could not be traversed.
    #[error("Extension discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A module import inside the runtime failed.
    #[error("Failed to import module {0}")]
    Import(String),

    /// A code snippet could not be handed to the runtime.
    #[error("Failed to run snippet: {0}")]
    Snippet(String),

    /// A lifecycle operation was called in the wrong state.
    #[error("Invalid lifecycle state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// The runtime is not available for addon loading.
    #[error("Runtime not ready: {0}")]
    NotReady(&'static str),

    /// Deinit was called from a thread other than the one that ran init.
    #[error("Lifecycle called from the wrong thread: init ran on {init:?}, now on {current:?}")]
    WrongThread {
        init: std::thread::ThreadId,
        current: std::thread::ThreadId,
    },

    /// Init or deinit overlapped with another lifecycle call.
    #[error("Concurrent lifecycle call rejected")]
    ConcurrentLifecycleCall,

    /// Filesystem errors while resolving paths.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest parsing errors while searching for the app root.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, LoaderError>;

impl LoaderError {
    pub fn library_not_found(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::LibraryNotFound {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn module_path(msg: impl Into<String>) -> Self {
        Self::ModulePath(msg.into())
    }

    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::DiscoveryFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoaderError::SymbolUnresolved("ten_py_finalize".to_string());
        assert_eq!(err.to_string(), "Failed to load symbol: ten_py_finalize");

        let err = LoaderError::library_not_found("/opt/libpython3.10.so", "no such file");
        assert!(err.to_string().contains("/opt/libpython3.10.so"));
        assert!(err.to_string().contains("no such file"));
    }
}
