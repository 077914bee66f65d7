//! The operations the loader needs from the embedded Python runtime.
//!
//! [`ForeignRuntime`] is implemented by [`crate::bridge::BridgeRuntime`] on
//! top of the bound bridge library, and by test doubles.

use std::ffi::c_void;
use std::path::PathBuf;

use crate::error::Result;

/// Saved interpreter thread state.
///
/// Produced by [`ForeignRuntime::save_execution_context`] and consumed by
/// [`ForeignRuntime::restore_execution_context`]. Not `Clone`: whoever holds
/// the token owns the execution context, and it can be handed back only once.
#[derive(Debug)]
pub struct ExecutionContextToken {
    raw: *mut c_void,
}

// Safety: the token is an opaque value; the lifecycle restores it on the
// thread that saved it and refuses to do so from any other thread.
unsafe impl Send for ExecutionContextToken {}
unsafe impl Sync for ExecutionContextToken {}

impl ExecutionContextToken {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self { raw }
    }

    pub fn into_raw(self) -> *mut c_void {
        self.raw
    }
}

/// Raw state returned by acquiring the runtime's global lock.
///
/// Held inside [`crate::gate::GlobalLockGuard`]; consumed by
/// [`ForeignRuntime::release_lock`]. Not `Send`: the lock state belongs to
/// the acquiring thread.
#[derive(Debug)]
pub struct RawLockToken {
    raw: *mut c_void,
}

impl RawLockToken {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self { raw }
    }

    pub fn into_raw(self) -> *mut c_void {
        self.raw
    }
}

/// Entry points of the embedded runtime used by the addon loader.
///
/// Except for the lock pair, every method must be called by a thread that
/// owns the runtime's execution context: the init thread before the context
/// is released, or a thread holding the global lock.
pub trait ForeignRuntime: Send + Sync {
    /// Whether another component already initialized the interpreter.
    fn is_initialized(&self) -> bool;

    fn initialize(&self);

    /// Returns the runtime's status code; negative means failure.
    fn finalize(&self) -> i32;

    /// Append entries to the module search path, in order.
    fn add_search_paths(&self, paths: &[PathBuf]) -> Result<()>;

    /// Run a source snippet in the main module.
    fn run_snippet(&self, code: &str) -> Result<()>;

    /// Current module search path, as rendered by the runtime.
    fn search_path(&self) -> Option<String>;

    /// Import a dotted module path. Returns false if the import failed.
    fn import_module(&self, module: &str) -> bool;

    /// Give up the execution context so other threads can take the global lock.
    fn save_execution_context(&self) -> ExecutionContextToken;

    fn restore_execution_context(&self, token: ExecutionContextToken);

    /// Block until the calling thread holds the global lock. Not reentrant.
    fn acquire_lock(&self) -> RawLockToken;

    fn release_lock(&self, token: RawLockToken);
}
