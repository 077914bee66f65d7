//! Shared test doubles for the lifecycle integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use pyloader_core::error::{LoaderError, Result};
use pyloader_core::lifecycle::RuntimeConnector;
use pyloader_core::runtime::{ExecutionContextToken, ForeignRuntime, RawLockToken};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    IsInitialized,
    Initialize,
    Finalize,
    AddPaths(Vec<PathBuf>),
    RunSnippet(String),
    SearchPath,
    Import(String),
    Save,
    Restore,
    Acquire,
    Release,
}

/// Runtime double that records every call and guards imports with a real lock.
pub struct RecordingRuntime {
    initialized: bool,
    finalize_rc: i32,
    failing_imports: HashSet<String>,
    calls: Mutex<Vec<Call>>,
    lock: RawMutex,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
}

impl RecordingRuntime {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn imports(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Import(module) => Some(module.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn snippets(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::RunSnippet(code) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    /// Largest number of threads that held the lock at the same time.
    pub fn max_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl ForeignRuntime for RecordingRuntime {
    fn is_initialized(&self) -> bool {
        self.record(Call::IsInitialized);
        self.initialized
    }

    fn initialize(&self) {
        self.record(Call::Initialize);
    }

    fn finalize(&self) -> i32 {
        self.record(Call::Finalize);
        self.finalize_rc
    }

    fn add_search_paths(&self, paths: &[PathBuf]) -> Result<()> {
        self.record(Call::AddPaths(paths.to_vec()));
        Ok(())
    }

    fn run_snippet(&self, code: &str) -> Result<()> {
        self.record(Call::RunSnippet(code.to_string()));
        Ok(())
    }

    fn search_path(&self) -> Option<String> {
        self.record(Call::SearchPath);
        Some("['/usr/lib/python3.10']".to_string())
    }

    fn import_module(&self, module: &str) -> bool {
        self.record(Call::Import(module.to_string()));
        std::thread::yield_now();
        !self.failing_imports.contains(module)
    }

    fn save_execution_context(&self) -> ExecutionContextToken {
        self.record(Call::Save);
        ExecutionContextToken::from_raw(0x10 as *mut _)
    }

    fn restore_execution_context(&self, token: ExecutionContextToken) {
        assert_eq!(token.into_raw(), 0x10 as *mut _);
        self.record(Call::Restore);
    }

    fn acquire_lock(&self) -> RawLockToken {
        self.lock.lock();
        let now = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(now, Ordering::SeqCst);
        self.record(Call::Acquire);
        RawLockToken::from_raw(std::ptr::null_mut())
    }

    fn release_lock(&self, _token: RawLockToken) {
        self.record(Call::Release);
        self.holders.fetch_sub(1, Ordering::SeqCst);
        // Safety: paired with the lock taken in acquire_lock.
        unsafe { self.lock.unlock() };
    }
}

/// Connector producing a [`RecordingRuntime`].
#[derive(Default)]
pub struct RecordingConnector {
    pub externally_initialized: bool,
    pub finalize_rc: i32,
    pub failing_imports: Vec<String>,
    pub app_base_dir: Option<PathBuf>,
}

impl RecordingConnector {
    pub fn with_app(app: &Path) -> Self {
        Self {
            app_base_dir: Some(app.to_path_buf()),
            ..Default::default()
        }
    }
}

impl RuntimeConnector for RecordingConnector {
    type Runtime = RecordingRuntime;

    fn connect(&self) -> Result<RecordingRuntime> {
        Ok(RecordingRuntime {
            initialized: self.externally_initialized,
            finalize_rc: self.finalize_rc,
            failing_imports: self.failing_imports.iter().cloned().collect(),
            calls: Mutex::new(Vec::new()),
            lock: RawMutex::INIT,
            holders: AtomicUsize::new(0),
            max_holders: AtomicUsize::new(0),
        })
    }

    fn app_base_dir(&self) -> Result<PathBuf> {
        self.app_base_dir
            .clone()
            .ok_or_else(|| LoaderError::module_path("no app manifest in test"))
    }
}

/// App tree with one directory per extension name.
pub fn app_with_extensions(names: &[&str]) -> tempfile::TempDir {
    let app = tempfile::tempdir().unwrap();
    std::fs::write(app.path().join("manifest.json"), r#"{"type": "app"}"#).unwrap();
    for name in names {
        std::fs::create_dir_all(app.path().join("ten_packages/extension").join(name)).unwrap();
    }
    app
}
