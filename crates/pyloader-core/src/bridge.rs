//! The bridge library: `libten_runtime_python`.
//!
//! The bridge exposes the interpreter through twelve plain C entry points.
//! They are resolved all at once into [`BridgeApi`]; if any one is missing,
//! binding fails and no entry point is ever called.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::lifecycle::RuntimeConnector;
use crate::locator::RuntimeLocator;
use crate::module::{LoadScope, ModuleHandle, SymbolSource, SystemLoader};
use crate::paths;
use crate::runtime::{ExecutionContextToken, ForeignRuntime, RawLockToken};

pub type IsInitializedFn = unsafe extern "C" fn() -> c_int;
pub type InitializeFn = unsafe extern "C" fn();
pub type FinalizeFn = unsafe extern "C" fn() -> c_int;
/// Appends `count` NUL-terminated paths to `sys.path`, in order.
///
/// The bridge must export this array form. A bridge build whose
/// `ten_py_add_paths_to_sys` still takes a `ten_list_t *` is not
/// ABI-compatible: binding by name succeeds but the call is undefined.
pub type AddPathsToSysFn = unsafe extern "C" fn(paths: *const *const c_char, count: usize);
pub type RunSimpleStringFn = unsafe extern "C" fn(code: *const c_char);
pub type GetPathFn = unsafe extern "C" fn() -> *const c_char;
pub type MemFreeFn = unsafe extern "C" fn(ptr: *mut c_void);
pub type ImportModuleFn = unsafe extern "C" fn(module_name: *const c_char) -> bool;
pub type EvalSaveThreadFn = unsafe extern "C" fn() -> *mut c_void;
pub type EvalRestoreThreadFn = unsafe extern "C" fn(state: *mut c_void);
pub type GilStateEnsureFn = unsafe extern "C" fn() -> *mut c_void;
pub type GilStateReleaseFn = unsafe extern "C" fn(state: *mut c_void);

/// Exported symbol names, in binding order.
pub mod symbols {
    pub const IS_INITIALIZED: &str = "ten_py_is_initialized";
    pub const INITIALIZE: &str = "ten_py_initialize";
    pub const FINALIZE: &str = "ten_py_finalize";
    pub const ADD_PATHS_TO_SYS: &str = "ten_py_add_paths_to_sys";
    pub const RUN_SIMPLE_STRING: &str = "ten_py_run_simple_string";
    pub const GET_PATH: &str = "ten_py_get_path";
    pub const MEM_FREE: &str = "ten_py_mem_free";
    pub const IMPORT_MODULE: &str = "ten_py_import_module";
    pub const EVAL_SAVE_THREAD: &str = "ten_py_eval_save_thread";
    pub const EVAL_RESTORE_THREAD: &str = "ten_py_eval_restore_thread";
    pub const GIL_STATE_ENSURE: &str = "ten_py_gil_state_ensure";
    pub const GIL_STATE_RELEASE: &str = "ten_py_gil_state_release";

    pub const ALL: [&str; 12] = [
        IS_INITIALIZED,
        INITIALIZE,
        FINALIZE,
        ADD_PATHS_TO_SYS,
        RUN_SIMPLE_STRING,
        GET_PATH,
        MEM_FREE,
        IMPORT_MODULE,
        EVAL_SAVE_THREAD,
        EVAL_RESTORE_THREAD,
        GIL_STATE_ENSURE,
        GIL_STATE_RELEASE,
    ];
}

/// Typed entry points of a bound bridge library.
#[derive(Clone, Copy)]
pub struct BridgeApi {
    pub is_initialized: IsInitializedFn,
    pub initialize: InitializeFn,
    pub finalize: FinalizeFn,
    pub add_paths_to_sys: AddPathsToSysFn,
    pub run_simple_string: RunSimpleStringFn,
    pub get_path: GetPathFn,
    pub mem_free: MemFreeFn,
    pub import_module: ImportModuleFn,
    pub eval_save_thread: EvalSaveThreadFn,
    pub eval_restore_thread: EvalRestoreThreadFn,
    pub gil_state_ensure: GilStateEnsureFn,
    pub gil_state_release: GilStateReleaseFn,
}

impl std::fmt::Debug for BridgeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeApi").finish_non_exhaustive()
    }
}

fn resolve(source: &impl SymbolSource, name: &'static str) -> Result<*mut c_void> {
    source.symbol(name).ok_or_else(|| {
        error!(symbol = name, "Failed to load symbol");
        LoaderError::SymbolUnresolved(name.to_string())
    })
}

impl BridgeApi {
    /// Resolve every entry point; the first missing name aborts the bind.
    ///
    /// # Safety
    ///
    /// Each symbol exported under these names must have the matching
    /// signature declared above.
    pub unsafe fn bind(source: &impl SymbolSource) -> Result<Self> {
        use std::mem::transmute;
        use symbols::*;

        let api = Self {
            is_initialized: transmute::<*mut c_void, IsInitializedFn>(resolve(source, IS_INITIALIZED)?),
            initialize: transmute::<*mut c_void, InitializeFn>(resolve(source, INITIALIZE)?),
            finalize: transmute::<*mut c_void, FinalizeFn>(resolve(source, FINALIZE)?),
            add_paths_to_sys: transmute::<*mut c_void, AddPathsToSysFn>(resolve(source, ADD_PATHS_TO_SYS)?),
            run_simple_string: transmute::<*mut c_void, RunSimpleStringFn>(resolve(source, RUN_SIMPLE_STRING)?),
            get_path: transmute::<*mut c_void, GetPathFn>(resolve(source, GET_PATH)?),
            mem_free: transmute::<*mut c_void, MemFreeFn>(resolve(source, MEM_FREE)?),
            import_module: transmute::<*mut c_void, ImportModuleFn>(resolve(source, IMPORT_MODULE)?),
            eval_save_thread: transmute::<*mut c_void, EvalSaveThreadFn>(resolve(source, EVAL_SAVE_THREAD)?),
            eval_restore_thread: transmute::<*mut c_void, EvalRestoreThreadFn>(resolve(source, EVAL_RESTORE_THREAD)?),
            gil_state_ensure: transmute::<*mut c_void, GilStateEnsureFn>(resolve(source, GIL_STATE_ENSURE)?),
            gil_state_release: transmute::<*mut c_void, GilStateReleaseFn>(resolve(source, GIL_STATE_RELEASE)?),
        };

        info!("Loaded all ten_py API functions");
        Ok(api)
    }
}

/// [`ForeignRuntime`] backed by a bound bridge library.
#[derive(Debug)]
pub struct BridgeRuntime {
    api: BridgeApi,
    /// Libraries the entry points live in, mapped for the rest of the process.
    _libraries: Vec<&'static ModuleHandle>,
}

impl BridgeRuntime {
    pub fn new(api: BridgeApi, libraries: Vec<&'static ModuleHandle>) -> Self {
        Self {
            api,
            _libraries: libraries,
        }
    }
}

impl ForeignRuntime for BridgeRuntime {
    fn is_initialized(&self) -> bool {
        unsafe { (self.api.is_initialized)() != 0 }
    }

    fn initialize(&self) {
        unsafe { (self.api.initialize)() }
    }

    fn finalize(&self) -> i32 {
        unsafe { (self.api.finalize)() }
    }

    fn add_search_paths(&self, paths: &[PathBuf]) -> Result<()> {
        let owned = paths
            .iter()
            .map(|p| {
                CString::new(p.to_string_lossy().into_owned()).map_err(|_| {
                    LoaderError::module_path(format!("search path contains a NUL byte: {:?}", p))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let pointers: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();

        // Safety: `owned` outlives the call; the bridge copies the strings.
        unsafe { (self.api.add_paths_to_sys)(pointers.as_ptr(), pointers.len()) };
        Ok(())
    }

    fn run_snippet(&self, code: &str) -> Result<()> {
        let code = CString::new(code)
            .map_err(|_| LoaderError::Snippet(format!("interior NUL byte in {:?}", code)))?;
        unsafe { (self.api.run_simple_string)(code.as_ptr()) };
        Ok(())
    }

    fn search_path(&self) -> Option<String> {
        let raw = unsafe { (self.api.get_path)() };
        if raw.is_null() {
            return None;
        }

        // Safety: the bridge returns an owned NUL-terminated string that must
        // be handed back to its allocator.
        let path = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.api.mem_free)(raw as *mut c_void) };
        Some(path)
    }

    fn import_module(&self, module: &str) -> bool {
        match CString::new(module) {
            Ok(name) => unsafe { (self.api.import_module)(name.as_ptr()) },
            Err(_) => false,
        }
    }

    fn save_execution_context(&self) -> ExecutionContextToken {
        ExecutionContextToken::from_raw(unsafe { (self.api.eval_save_thread)() })
    }

    fn restore_execution_context(&self, token: ExecutionContextToken) {
        unsafe { (self.api.eval_restore_thread)(token.into_raw()) }
    }

    fn acquire_lock(&self) -> RawLockToken {
        RawLockToken::from_raw(unsafe { (self.api.gil_state_ensure)() })
    }

    fn release_lock(&self, token: RawLockToken) {
        unsafe { (self.api.gil_state_release)(token.into_raw()) }
    }
}

/// Loads libpython and the bridge library from the app layout and binds the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    config: LoaderConfig,
}

impl BridgeConnector {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Path the bridge library is expected at, next to this module.
    pub fn bridge_path(&self) -> Result<PathBuf> {
        let module_dir = paths::own_module_dir()?;
        debug!(module_dir = %module_dir.display(), "python_addon_loader path");
        paths::bridge_library_path(&module_dir, &self.config.runtime_package)
    }
}

impl RuntimeConnector for BridgeConnector {
    type Runtime = BridgeRuntime;

    fn connect(&self) -> Result<BridgeRuntime> {
        info!("Starting to load Python libraries");

        // libpython first: the bridge does not link against it and needs its
        // symbols to be globally visible.
        let python = RuntimeLocator::from_config(&self.config)
            .locate_and_load(&SystemLoader)?
            .handle
            .leak();

        let bridge_path = self.bridge_path()?;
        info!(path = %bridge_path.display(), "Attempting to load bridge library");
        let bridge = ModuleHandle::load(&bridge_path, LoadScope::Restricted)
            .map_err(|e| {
                error!(path = %bridge_path.display(), error = %e, "Failed to load bridge library, this is a critical error");
                LoaderError::BridgeNotFound {
                    path: bridge_path.clone(),
                    reason: e.to_string(),
                }
            })?
            .leak();

        // Safety: the bridge library is built from the same C declarations.
        let api = unsafe { BridgeApi::bind(bridge)? };

        info!("Loaded all Python libraries and API functions");
        Ok(BridgeRuntime::new(api, vec![python, bridge]))
    }
}
