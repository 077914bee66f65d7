//! Host-facing addon loader.
//!
//! The host drives the loader through three hooks, each finishing by calling
//! its `done` callback exactly once. Errors are handed to `done`, never
//! raised past it, so the host's own sequencing is never stalled.

use once_cell::sync::Lazy;
use tracing::{error, warn};

use crate::bridge::BridgeConnector;
use crate::config::LoaderConfig;
use crate::discovery::AddonKind;
use crate::error::Result;
use crate::lifecycle::{RuntimeConnector, RuntimeLifecycle};

/// Completion callback handed to every hook.
pub type DoneCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Contract between the host and an addon loader.
pub trait AddonLoaderHooks: Send + Sync {
    fn on_init(&self, done: DoneCallback);

    fn on_deinit(&self, done: DoneCallback);

    /// May be called from any host thread after init.
    fn on_load_addon(&self, kind: AddonKind, name: &str, done: DoneCallback);
}

/// Addon loader backed by an embedded Python runtime.
pub struct PythonAddonLoader<C: RuntimeConnector> {
    connector: C,
    lifecycle: RuntimeLifecycle<C::Runtime>,
}

impl<C: RuntimeConnector> PythonAddonLoader<C> {
    pub fn new(config: LoaderConfig, connector: C) -> Self {
        Self {
            connector,
            lifecycle: RuntimeLifecycle::new(config),
        }
    }

    pub fn lifecycle(&self) -> &RuntimeLifecycle<C::Runtime> {
        &self.lifecycle
    }
}

impl<C> AddonLoaderHooks for PythonAddonLoader<C>
where
    C: RuntimeConnector + Send + Sync,
{
    fn on_init(&self, done: DoneCallback) {
        let result = self.lifecycle.init(&self.connector).map(|_| ());
        if let Err(e) = &result {
            error!(error = %e, "Python addon loader init failed");
        }
        done(result);
    }

    fn on_deinit(&self, done: DoneCallback) {
        let result = self.lifecycle.deinit().map(|_| ());
        if let Err(e) = &result {
            error!(error = %e, "Python addon loader deinit failed");
        }
        done(result);
    }

    fn on_load_addon(&self, kind: AddonKind, name: &str, done: DoneCallback) {
        // A failed import only means this addon is not a Python one.
        let result = self.lifecycle.on_load_addon(kind, name).map(|_| ());
        if let Err(e) = &result {
            warn!(%kind, name, error = %e, "Python addon load rejected");
        }
        done(result);
    }
}

static GLOBAL: Lazy<PythonAddonLoader<BridgeConnector>> = Lazy::new(|| {
    let config = LoaderConfig::from_env();
    PythonAddonLoader::new(config.clone(), BridgeConnector::new(config))
});

/// The process-wide loader the host registers.
pub fn global() -> &'static PythonAddonLoader<BridgeConnector> {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoaderError;
    use crate::runtime::{ExecutionContextToken, ForeignRuntime, RawLockToken};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct Quiet;

    impl ForeignRuntime for Quiet {
        fn is_initialized(&self) -> bool {
            false
        }
        fn initialize(&self) {}
        fn finalize(&self) -> i32 {
            0
        }
        fn add_search_paths(&self, _paths: &[PathBuf]) -> Result<()> {
            Ok(())
        }
        fn run_snippet(&self, _code: &str) -> Result<()> {
            Ok(())
        }
        fn search_path(&self) -> Option<String> {
            None
        }
        fn import_module(&self, _module: &str) -> bool {
            false
        }
        fn save_execution_context(&self) -> ExecutionContextToken {
            ExecutionContextToken::from_raw(std::ptr::null_mut())
        }
        fn restore_execution_context(&self, _token: ExecutionContextToken) {}
        fn acquire_lock(&self) -> RawLockToken {
            RawLockToken::from_raw(std::ptr::null_mut())
        }
        fn release_lock(&self, _token: RawLockToken) {}
    }

    struct QuietConnector;

    impl RuntimeConnector for QuietConnector {
        type Runtime = Quiet;

        fn connect(&self) -> Result<Quiet> {
            Ok(Quiet)
        }

        fn app_base_dir(&self) -> Result<PathBuf> {
            Err(LoaderError::module_path("no app"))
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, impl Fn() -> DoneCallback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let make = move || -> DoneCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |result: Result<()>| sink.lock().push(result.is_ok()))
        };
        (calls, make)
    }

    #[test]
    fn test_every_hook_calls_done_once() {
        let loader = PythonAddonLoader::new(LoaderConfig::default(), QuietConnector);
        let (calls, done) = recorder();

        loader.on_load_addon(AddonKind::Extension, "early", done());
        loader.on_init(done());
        // Nothing to import is still a completed load.
        loader.on_load_addon(AddonKind::Extension, "missing", done());
        loader.on_deinit(done());
        loader.on_deinit(done());

        assert_eq!(*calls.lock(), vec![false, true, true, true, true]);
    }
}
