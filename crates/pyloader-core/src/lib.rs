//! Python addon loader.
//!
//! Embeds a Python runtime into a native addon host: finds and loads
//! libpython, binds the `ten_runtime_python` bridge library, brings the
//! interpreter up once, and imports Python addons on demand from any host
//! thread under the interpreter's global lock.

pub mod addon;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod locator;
pub mod module;
pub mod paths;
pub mod runtime;

pub use addon::{AddonLoaderHooks, DoneCallback, PythonAddonLoader};
pub use bridge::{BridgeApi, BridgeConnector, BridgeRuntime};
pub use config::{DebugConfig, DebugEndpoint, LoaderConfig};
pub use discovery::{AddonKind, ExtensionDescriptor, ImportReport};
pub use error::{LoaderError, Result};
pub use lifecycle::{LifecycleState, Ownership, RuntimeConnector, RuntimeLifecycle};
pub use locator::{RuntimeCandidate, RuntimeLocator};
pub use module::{LoadScope, ModuleHandle, ModuleLoader, SystemLoader};
pub use runtime::{ExecutionContextToken, ForeignRuntime, RawLockToken};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, LoaderConfig};
    pub use crate::discovery::{AddonKind, ExtensionDescriptor};
    pub use crate::error::{LoaderError, Result};
    pub use crate::gate::{with_global_lock, GlobalLockGuard};
    pub use crate::lifecycle::{DeinitOutcome, InitOutcome, LifecycleState, RuntimeLifecycle};
    pub use crate::runtime::ForeignRuntime;
}
