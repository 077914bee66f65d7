//! Runtime lifecycle: bring the interpreter up once, serve addon loads from any
//! thread, and take it down once.
//!
//! ```text
//! Unloaded -> LibrariesLoaded -> InitializedBySelf     -> ExecutionContextReleased -> Finalized
//!                             -> InitializedExternally -> ExecutionContextReleased -> Detached
//! Unloaded -> Failed
//! ```
//!
//! The host promises to call init and deinit on one thread and never at the
//! same time. Both promises are checked: a violation is an error, not
//! undefined behavior.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::discovery::{self, AddonKind, ExtensionDescriptor, ImportReport};
use crate::error::{LoaderError, Result};
use crate::gate::with_global_lock;
use crate::paths;
use crate::runtime::{ExecutionContextToken, ForeignRuntime};

/// Produces a ready-to-use runtime.
pub trait RuntimeConnector {
    type Runtime: ForeignRuntime;

    /// Load the runtime and bridge libraries and bind the entry points.
    fn connect(&self) -> Result<Self::Runtime>;

    /// Root of the application the loader is installed in.
    fn app_base_dir(&self) -> Result<PathBuf> {
        paths::find_app_base_dir(&paths::own_module_dir()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unloaded,
    LibrariesLoaded,
    InitializedBySelf,
    InitializedExternally,
    ExecutionContextReleased,
    /// The runtime was finalized by this loader.
    Finalized,
    /// Someone else owns the runtime; it was left running.
    Detached,
    /// Init failed before the runtime was touched.
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::LibrariesLoaded => "libraries_loaded",
            LifecycleState::InitializedBySelf => "initialized_by_self",
            LifecycleState::InitializedExternally => "initialized_externally",
            LifecycleState::ExecutionContextReleased => "execution_context_released",
            LifecycleState::Finalized => "finalized",
            LifecycleState::Detached => "detached",
            LifecycleState::Failed => "failed",
        }
    }
}

/// Who initialized the interpreter, and therefore who finalizes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    SelfInitialized,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitOutcome {
    pub ownership: Ownership,
    pub app_base_dir: Option<PathBuf>,
    /// Present when extensions were imported during init.
    pub eager_imports: Option<ImportReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeinitOutcome {
    Finalized,
    Detached,
    NothingToDo,
}

struct Inner<R> {
    state: LifecycleState,
    runtime: Option<Arc<R>>,
    ownership: Option<Ownership>,
    context: Option<ExecutionContextToken>,
    init_thread: Option<ThreadId>,
}

impl<R> Default for Inner<R> {
    fn default() -> Self {
        Self {
            state: LifecycleState::Unloaded,
            runtime: None,
            ownership: None,
            context: None,
            init_thread: None,
        }
    }
}

/// Drives one embedded runtime through its lifecycle.
pub struct RuntimeLifecycle<R: ForeignRuntime> {
    config: LoaderConfig,
    inner: RwLock<Inner<R>>,
    /// Held for the whole of init and deinit.
    sequence: Mutex<()>,
}

impl<R: ForeignRuntime> RuntimeLifecycle<R> {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
            sequence: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.read().state
    }

    pub fn runtime(&self) -> Option<Arc<R>> {
        self.inner.read().runtime.clone()
    }

    fn set_state(&self, state: LifecycleState) {
        let mut inner = self.inner.write();
        debug!(from = inner.state.as_str(), to = state.as_str(), "Lifecycle transition");
        inner.state = state;
    }

    /// Bring the runtime up and release its execution context.
    pub fn init<C>(&self, connector: &C) -> Result<InitOutcome>
    where
        C: RuntimeConnector<Runtime = R>,
    {
        let _sequence = self.sequence.try_lock().ok_or_else(|| {
            error!("init called while another lifecycle call is running");
            LoaderError::ConcurrentLifecycleCall
        })?;

        let state = self.state();
        if state != LifecycleState::Unloaded {
            error!(state = state.as_str(), "init called twice");
            return Err(LoaderError::InvalidState {
                expected: LifecycleState::Unloaded.as_str(),
                found: state.as_str(),
            });
        }

        let runtime = match connector.connect() {
            Ok(runtime) => Arc::new(runtime),
            Err(e) => {
                error!(error = %e, "Failed to load Python libraries");
                self.set_state(LifecycleState::Failed);
                return Err(e);
            }
        };
        {
            let mut inner = self.inner.write();
            inner.runtime = Some(Arc::clone(&runtime));
        }
        self.set_state(LifecycleState::LibrariesLoaded);

        let mut outcome = InitOutcome {
            ownership: Ownership::SelfInitialized,
            app_base_dir: None,
            eager_imports: None,
        };

        if runtime.is_initialized() {
            // Another component owns the interpreter and its setup.
            info!("Python runtime already initialized, skipping setup");
            outcome.ownership = Ownership::External;
            self.set_state(LifecycleState::InitializedExternally);
        } else {
            runtime.initialize();
            self.set_state(LifecycleState::InitializedBySelf);
            self.prepare_runtime(connector, runtime.as_ref(), &mut outcome);
        }

        let context = runtime.save_execution_context();
        {
            let mut inner = self.inner.write();
            inner.ownership = Some(outcome.ownership);
            inner.context = Some(context);
            inner.init_thread = Some(thread::current().id());
        }
        self.set_state(LifecycleState::ExecutionContextReleased);

        info!(ownership = ?outcome.ownership, "Python addon loader initialized");
        Ok(outcome)
    }

    /// Search paths, debugger and eager imports. Nothing here aborts init.
    fn prepare_runtime<C>(&self, connector: &C, runtime: &R, outcome: &mut InitOutcome)
    where
        C: RuntimeConnector<Runtime = R>,
    {
        let base_dir = match connector.app_base_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                error!(error = %e, "Failed to find app base dir, skipping search paths and extensions");
                None
            }
        };

        if let Some(base_dir) = &base_dir {
            let search_paths =
                paths::runtime_search_paths(base_dir, &self.config.namespace, &self.config.runtime_package);
            match runtime.add_search_paths(&search_paths) {
                Ok(()) => match runtime.search_path() {
                    Some(path) => info!(sys_path = %path, "Python search path"),
                    None => debug!("Python search path unavailable"),
                },
                Err(e) => error!(error = %e, "Failed to add Python search paths"),
            }
        }

        self.start_debugger(runtime);

        if let (true, Some(base_dir)) = (self.config.load_all_on_init, &base_dir) {
            let root = paths::extensions_dir(base_dir, &self.config.namespace);
            match discovery::import_all(runtime, &root, &self.config.namespace) {
                Ok(report) => outcome.eager_imports = Some(report),
                Err(e) => warn!(root = %root.display(), error = %e, "Failed to load Python extensions"),
            }
        }

        outcome.app_base_dir = base_dir;
    }

    fn start_debugger(&self, runtime: &R) {
        match self.config.debug.endpoint() {
            Ok(Some(endpoint)) => {
                info!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    "Waiting for Python debugger to attach"
                );
                let started = endpoint
                    .bootstrap_snippet()
                    .and_then(|code| runtime.run_snippet(&code));
                if let Err(e) = started {
                    error!(error = %e, "Failed to start Python debugger");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Skipping Python debugger"),
        }
    }

    /// Take the execution context back and finalize if this loader owns the runtime.
    ///
    /// # Panics
    ///
    /// If the runtime reports a negative status from finalize.
    pub fn deinit(&self) -> Result<DeinitOutcome> {
        let _sequence = self.sequence.try_lock().ok_or_else(|| {
            error!("deinit called while another lifecycle call is running");
            LoaderError::ConcurrentLifecycleCall
        })?;

        let mut inner = self.inner.write();
        match inner.state {
            LifecycleState::ExecutionContextReleased => {}
            LifecycleState::Unloaded
            | LifecycleState::Failed
            | LifecycleState::Finalized
            | LifecycleState::Detached => {
                info!(state = inner.state.as_str(), "Nothing to deinit");
                return Ok(DeinitOutcome::NothingToDo);
            }
            other => {
                return Err(LoaderError::InvalidState {
                    expected: LifecycleState::ExecutionContextReleased.as_str(),
                    found: other.as_str(),
                })
            }
        }

        let current = thread::current().id();
        if let Some(init) = inner.init_thread {
            if init != current {
                error!(?init, ?current, "deinit must run on the thread that ran init");
                return Err(LoaderError::WrongThread { init, current });
            }
        }

        let Some(runtime) = inner.runtime.take() else {
            return Err(LoaderError::NotReady(inner.state.as_str()));
        };

        if let Some(context) = inner.context.take() {
            runtime.restore_execution_context(context);
        }

        let outcome = match inner.ownership {
            Some(Ownership::SelfInitialized) => {
                let rc = runtime.finalize();
                if rc < 0 {
                    error!(rc, "Failed to finalize Python runtime");
                    panic!("Python runtime finalize failed with status {}", rc);
                }
                inner.state = LifecycleState::Finalized;
                DeinitOutcome::Finalized
            }
            _ => {
                info!("Python runtime owned elsewhere, leaving it running");
                inner.state = LifecycleState::Detached;
                DeinitOutcome::Detached
            }
        };

        info!(state = inner.state.as_str(), "Python addon loader deinitialized");
        Ok(outcome)
    }

    /// Import `<namespace>.<kind>.<name>` under the global lock.
    ///
    /// Returns whether the import succeeded; a failed import is not an error.
    pub fn on_load_addon(&self, kind: AddonKind, name: &str) -> Result<bool> {
        let runtime = {
            let inner = self.inner.read();
            match (&inner.runtime, inner.state) {
                (Some(runtime), LifecycleState::ExecutionContextReleased) => Arc::clone(runtime),
                (_, state) => {
                    warn!(state = state.as_str(), %kind, name, "Addon load before init or after deinit");
                    return Err(LoaderError::NotReady(state.as_str()));
                }
            }
        };

        let module = ExtensionDescriptor::new(kind, name).module_name(&self.config.namespace);

        let imported = with_global_lock(runtime.as_ref(), |rt| rt.import_module(&module));

        if imported {
            debug!(module = %module, "Loaded Python addon");
        } else {
            info!(module = %module, "Nothing to load for Python addon");
        }
        Ok(imported)
    }
}

impl<R: ForeignRuntime> std::fmt::Debug for RuntimeLifecycle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RuntimeLifecycle")
            .field("state", &inner.state)
            .field("ownership", &inner.ownership)
            .field("init_thread", &inner.init_thread)
            .finish()
    }
}
