//! Paths derived from where this module is loaded.
//!
//! The loader never asks the host where things are. The bridge library and
//! the app root are found relative to the shared object this code lives in:
//!
//! ```text
//! <app>/manifest.json                                  {"type": "app", ...}
//! <app>/ten_packages/addon_loader/python_addon_loader/lib/<this module>
//! <app>/ten_packages/system/ten_runtime_python/lib/libten_runtime_python.so
//! <app>/ten_packages/system/ten_runtime_python/interface/
//! <app>/ten_packages/extension/<name>/
//! ```

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LoaderError, Result};

/// Manifest file marking a package or app directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest `type` value of the application root.
pub const APP_MANIFEST_TYPE: &str = "app";

/// File extension of Python extension modules. Python only imports `.so` on
/// macOS too, and `.pyd` on Windows.
#[cfg(windows)]
const EXTENSION_MODULE_SUFFIX: &str = "pyd";
#[cfg(not(windows))]
const EXTENSION_MODULE_SUFFIX: &str = "so";

fn anchor() {}

/// Full path of the shared object (or executable) containing this crate.
pub fn own_module_path() -> Result<PathBuf> {
    let path = module_path_of(anchor as fn() as *const c_void)?;
    // The main executable may be reported by its (possibly relative) argv[0].
    Ok(path.canonicalize().unwrap_or(path))
}

/// Directory of the shared object containing this crate.
pub fn own_module_dir() -> Result<PathBuf> {
    let path = own_module_path()?;
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| LoaderError::module_path(format!("{} has no parent", path.display())))
}

#[cfg(unix)]
fn module_path_of(address: *const c_void) -> Result<PathBuf> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    // Safety: `Dl_info` is plain data and dladdr only writes into it.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(address, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return Err(LoaderError::module_path("dladdr could not resolve own module"));
    }

    // Safety: dli_fname points at a NUL-terminated string owned by the loader.
    let name = unsafe { CStr::from_ptr(info.dli_fname) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

#[cfg(windows)]
fn module_path_of(address: *const c_void) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let mut module = HMODULE::default();
    // Safety: with FROM_ADDRESS the name argument is an address inside the module.
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            PCWSTR(address as *const u16),
            &mut module,
        )
    }
    .map_err(|e| LoaderError::module_path(format!("GetModuleHandleExW failed: {}", e)))?;

    let mut buffer = vec![0u16; 32 * 1024];
    let len = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
    if len == 0 || len >= buffer.len() {
        return Err(LoaderError::module_path("GetModuleFileNameW failed"));
    }

    Ok(PathBuf::from(OsString::from_wide(&buffer[..len])))
}

/// File name of the bridge extension module for a runtime package.
pub fn bridge_library_file(runtime_package: &str) -> String {
    format!("lib{}.{}", runtime_package, EXTENSION_MODULE_SUFFIX)
}

/// Location of the bridge library relative to the addon loader's `lib/` directory.
///
/// `<module_dir>/../../../system/<runtime_package>/lib/<bridge file>`, with
/// the directory part canonicalized so `.` and `..` are resolved and the
/// separators are native.
pub fn bridge_library_path(module_dir: &Path, runtime_package: &str) -> Result<PathBuf> {
    let lib_dir = module_dir
        .join("..")
        .join("..")
        .join("..")
        .join("system")
        .join(runtime_package)
        .join("lib");

    let lib_dir = lib_dir.canonicalize().map_err(|e| {
        LoaderError::module_path(format!("Failed to normalize {}: {}", lib_dir.display(), e))
    })?;

    Ok(lib_dir.join(bridge_library_file(runtime_package)))
}

/// Walk up from `start` to the first directory whose manifest declares an app.
pub fn find_app_base_dir(start: &Path) -> Result<PathBuf> {
    for dir in start.ancestors() {
        let manifest = dir.join(MANIFEST_FILE);
        if !manifest.is_file() {
            continue;
        }

        match manifest_type(&manifest) {
            Ok(Some(kind)) if kind == APP_MANIFEST_TYPE => {
                debug!(app_base_dir = %dir.display(), "Found app base dir");
                return Ok(dir.to_path_buf());
            }
            Ok(_) => {}
            Err(e) => warn!(manifest = %manifest.display(), error = %e, "Skipping unreadable manifest"),
        }
    }

    Err(LoaderError::module_path(format!(
        "No app manifest found above {}",
        start.display()
    )))
}

fn manifest_type(manifest: &Path) -> Result<Option<String>> {
    let content = std::fs::read_to_string(manifest)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    Ok(value.get("type").and_then(|t| t.as_str()).map(str::to_string))
}

/// Search path entries appended for an app, in import priority order.
pub fn runtime_search_paths(app_base_dir: &Path, namespace: &str, runtime_package: &str) -> Vec<PathBuf> {
    let package_dir = app_base_dir.join(namespace).join("system").join(runtime_package);
    vec![
        package_dir.join("lib"),
        package_dir.join("interface"),
        // Lets `<namespace>.extension.<name>` resolve from the app root.
        app_base_dir.to_path_buf(),
    ]
}

/// Directory holding one sub-directory per Python extension.
pub fn extensions_dir(app_base_dir: &Path, namespace: &str) -> PathBuf {
    app_base_dir.join(namespace).join("extension")
}
