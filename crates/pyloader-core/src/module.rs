//! Cross-platform dynamic library loading.
//!
//! Two search scopes are supported:
//!
//! - [`LoadScope::Restricted`]: on Windows the DLL search is limited to the
//!   application directory, the directory of the library being loaded and the
//!   system directory, so a same-named DLL planted earlier in `PATH` is never
//!   picked up. On Unix the library is opened with `RTLD_NOW | RTLD_GLOBAL`;
//!   global visibility is needed so Python C extensions loaded later can
//!   resolve interpreter symbols.
//! - [`LoadScope::PathSearch`]: the standard named lookup honoring the process
//!   library search path. Only used for bare library names that live in a
//!   system location known to the loader but not at a fixed path.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{debug, warn};

use crate::error::{LoaderError, Result};

/// How the OS loader may search for a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadScope {
    Restricted,
    PathSearch,
}

/// An owned, loaded dynamic library.
///
/// Dropping the handle unloads the library. Use [`ModuleHandle::close`] to
/// observe unload failures, or [`ModuleHandle::leak`] to keep the library
/// mapped for the rest of the process.
#[derive(Debug)]
pub struct ModuleHandle {
    library: Library,
    path: PathBuf,
    scope: LoadScope,
}

impl ModuleHandle {
    /// Load the library at `path` with the given search scope.
    pub fn load(path: impl AsRef<Path>, scope: LoadScope) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(LoaderError::library_not_found(path, "empty library path"));
        }

        let library =
            open_library(path, scope).map_err(|e| LoaderError::library_not_found(path, e))?;

        debug!(path = %path.display(), ?scope, "Loaded library");

        Ok(Self {
            library,
            path: path.to_path_buf(),
            scope,
        })
    }

    /// Path the library was requested with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> LoadScope {
        self.scope
    }

    /// Resolve a symbol address.
    ///
    /// Returns `None` for an empty name or an unresolved symbol. The platform
    /// error text is logged and then dropped, callers only see "not found".
    pub fn symbol(&self, name: &str) -> Option<*mut c_void> {
        if name.is_empty() {
            warn!("Invalid argument: symbol name is empty");
            return None;
        }

        // Safety: the symbol is read as an untyped address; the caller decides
        // the type it is cast to.
        match unsafe { self.library.get::<*mut c_void>(name.as_bytes()) } {
            Ok(symbol) => {
                let address = *symbol;
                (!address.is_null()).then_some(address)
            }
            Err(e) => {
                debug!(symbol = name, path = %self.path.display(), error = %e, "Symbol not found");
                None
            }
        }
    }

    /// Unload the library.
    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.library.close().map_err(|e| {
            LoaderError::LibraryClose(format!("{}: {}", path.display(), e))
        })
    }

    /// Keep the library mapped until the process exits.
    pub fn leak(self) -> &'static ModuleHandle {
        Box::leak(Box::new(self))
    }
}

#[cfg(unix)]
fn open_library(path: &Path, _scope: LoadScope) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    // Safety: loading a library runs its initializers; the candidates are
    // either operator-provided or fixed install locations.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL).map(Library::from) }
}

#[cfg(windows)]
fn open_library(path: &Path, scope: LoadScope) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::windows::{
        Library as WindowsLibrary, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
        LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
    };

    // Safety: see the unix variant.
    let library = unsafe {
        match scope {
            LoadScope::Restricted => WindowsLibrary::load_with_flags(
                path,
                LOAD_LIBRARY_SEARCH_DEFAULT_DIRS | LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
            ),
            LoadScope::PathSearch => WindowsLibrary::new(path),
        }
    };

    library.map(Library::from)
}

/// Source of raw symbol addresses, implemented by loaded libraries.
pub trait SymbolSource {
    fn symbol(&self, name: &str) -> Option<*mut c_void>;
}

impl SymbolSource for ModuleHandle {
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        ModuleHandle::symbol(self, name)
    }
}

impl<T: SymbolSource + ?Sized> SymbolSource for &T {
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        (**self).symbol(name)
    }
}

/// Something that can open libraries.
///
/// The locator is written against this trait so the candidate walk can be
/// exercised without touching the OS loader.
pub trait ModuleLoader {
    type Handle;

    fn load(&self, path: &Path, scope: LoadScope) -> Result<Self::Handle>;
}

/// [`ModuleLoader`] backed by the OS dynamic loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoader;

impl ModuleLoader for SystemLoader {
    type Handle = ModuleHandle;

    fn load(&self, path: &Path, scope: LoadScope) -> Result<ModuleHandle> {
        ModuleHandle::load(path, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path_is_rejected() {
        let result = ModuleHandle::load("", LoadScope::Restricted);
        assert!(matches!(result, Err(LoaderError::LibraryNotFound { .. })));
    }

    #[test]
    fn test_missing_library_reports_path() {
        let path = Path::new("/nonexistent/pyloader/libmissing.so");
        match SystemLoader.load(path, LoadScope::Restricted) {
            Err(LoaderError::LibraryNotFound { path: reported, reason }) => {
                assert_eq!(reported, path);
                assert!(!reason.is_empty());
            }
            other => panic!("expected LibraryNotFound, got {:?}", other.map(|h| h.path)),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_library_symbols() {
        // The C library is always mapped into a Rust process on Linux.
        let handle = match ModuleHandle::load("libc.so.6", LoadScope::PathSearch) {
            Ok(handle) => handle,
            Err(_) => return,
        };

        assert!(handle.symbol("strlen").is_some());
        assert!(handle.symbol("pyloader_no_such_symbol").is_none());
        assert!(handle.symbol("").is_none());
        assert_eq!(handle.scope(), LoadScope::PathSearch);
        assert!(handle.close().is_ok());
    }
}
