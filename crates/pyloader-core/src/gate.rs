//! Scoped access to the runtime's global lock.
//!
//! Host worker threads call into the loader at any time after init. Each of
//! those touches must hold the runtime's global lock for its whole duration.
//! [`GlobalLockGuard`] acquires it on construction and releases it exactly
//! once, on [`GlobalLockGuard::release`] or on drop, so early returns and
//! panics cannot leak the lock.

use std::marker::PhantomData;

use crate::runtime::{ForeignRuntime, RawLockToken};

/// Holds the runtime's global lock for the current thread.
///
/// Not `Send`: the lock must be released by the thread that took it. The lock
/// is not reentrant, so a thread holding a guard must not create another.
pub struct GlobalLockGuard<'a, R: ForeignRuntime + ?Sized> {
    runtime: &'a R,
    token: Option<RawLockToken>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, R: ForeignRuntime + ?Sized> GlobalLockGuard<'a, R> {
    /// Block until the lock is held.
    pub fn acquire(runtime: &'a R) -> Self {
        let token = runtime.acquire_lock();
        Self {
            runtime,
            token: Some(token),
            _not_send: PhantomData,
        }
    }

    /// The runtime, usable while the lock is held.
    pub fn runtime(&self) -> &'a R {
        self.runtime
    }

    /// Release the lock now.
    pub fn release(self) {
        drop(self)
    }
}

impl<R: ForeignRuntime + ?Sized> Drop for GlobalLockGuard<'_, R> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.runtime.release_lock(token);
        }
    }
}

/// Run `f` with the global lock held.
pub fn with_global_lock<R, T, F>(runtime: &R, f: F) -> T
where
    R: ForeignRuntime + ?Sized,
    F: FnOnce(&R) -> T,
{
    let guard = GlobalLockGuard::acquire(runtime);
    let result = f(guard.runtime());
    guard.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::runtime::ExecutionContextToken;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct LockLog {
        events: Mutex<Vec<&'static str>>,
    }

    impl ForeignRuntime for LockLog {
        fn is_initialized(&self) -> bool {
            true
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
            self.events.lock().push("import");
            true
        }
        fn save_execution_context(&self) -> ExecutionContextToken {
            ExecutionContextToken::from_raw(std::ptr::null_mut())
        }
        fn restore_execution_context(&self, _token: ExecutionContextToken) {}
        fn acquire_lock(&self) -> RawLockToken {
            self.events.lock().push("acquire");
            RawLockToken::from_raw(std::ptr::null_mut())
        }
        fn release_lock(&self, _token: RawLockToken) {
            self.events.lock().push("release");
        }
    }

    #[test]
    fn test_guard_releases_once_on_explicit_release() {
        let runtime = LockLog::default();
        let guard = GlobalLockGuard::acquire(&runtime);
        guard.runtime().import_module("a");
        guard.release();
        assert_eq!(*runtime.events.lock(), vec!["acquire", "import", "release"]);
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn touch(runtime: &LockLog, bail: bool) -> Option<()> {
            let guard = GlobalLockGuard::acquire(runtime);
            if bail {
                return None;
            }
            guard.runtime().import_module("a");
            Some(())
        }

        let runtime = LockLog::default();
        assert!(touch(&runtime, true).is_none());
        assert_eq!(*runtime.events.lock(), vec!["acquire", "release"]);
    }

    #[test]
    fn test_with_global_lock_brackets_closure() {
        let runtime = LockLog::default();
        let imported = with_global_lock(&runtime, |rt| rt.import_module("b"));
        assert!(imported);
        assert_eq!(*runtime.events.lock(), vec!["acquire", "import", "release"]);
    }
}
