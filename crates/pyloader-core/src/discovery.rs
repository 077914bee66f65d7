//! Python extension discovery and import.
//!
//! Every sub-directory of `<app>/<namespace>/extension/` is a Python package
//! named after the directory. Importing `<namespace>.extension.<name>` runs
//! the package's addon registration. One broken extension never stops the
//! others from loading.

use std::ffi::OsString;
use std::fmt;
use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LoaderError, Result};
use crate::runtime::ForeignRuntime;

/// Registers every addon the imported modules declared.
pub const REGISTER_ALL_ADDONS_SNIPPET: &str =
    "from ten_runtime import _AddonManager\n_AddonManager.register_all_addons(None)\n";

/// Category of an addon; also the middle segment of its module path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonKind {
    Extension,
    ExtensionGroup,
    Protocol,
    AddonLoader,
}

impl AddonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonKind::Extension => "extension",
            AddonKind::ExtensionGroup => "extension_group",
            AddonKind::Protocol => "protocol",
            AddonKind::AddonLoader => "addon_loader",
        }
    }
}

impl fmt::Display for AddonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddonKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extension" => Ok(AddonKind::Extension),
            "extension_group" => Ok(AddonKind::ExtensionGroup),
            "protocol" => Ok(AddonKind::Protocol),
            "addon_loader" => Ok(AddonKind::AddonLoader),
            other => Err(format!("unknown addon kind: {}", other)),
        }
    }
}

/// One importable addon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub kind: AddonKind,
    pub short_name: String,
}

impl ExtensionDescriptor {
    pub fn new(kind: AddonKind, short_name: impl Into<String>) -> Self {
        Self {
            kind,
            short_name: short_name.into(),
        }
    }

    pub fn extension(short_name: impl Into<String>) -> Self {
        Self::new(AddonKind::Extension, short_name)
    }

    /// Dotted module path, e.g. `ten_packages.extension.vad`.
    pub fn module_name(&self, namespace: &str) -> String {
        format!("{}.{}.{}", namespace, self.kind, self.short_name)
    }
}

fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Entry names of an opened directory. Unreadable entries are logged and skipped.
#[derive(Debug)]
pub struct DirNames {
    root: PathBuf,
    entries: ReadDir,
}

impl Iterator for DirNames {
    type Item = OsString;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            match entry {
                Ok(entry) => return Some(entry.file_name()),
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Failed to read extension entry");
                }
            }
        }
        None
    }
}

/// Lazy iterator of extension descriptors over a source of entry names.
///
/// `.` and `..` are skipped, as are names that are not valid UTF-8. Each call
/// to [`discover`] opens the directory again, so traversal can be restarted
/// at will.
#[derive(Debug)]
pub struct ExtensionEntries<I = DirNames> {
    names: I,
}

impl<I> ExtensionEntries<I>
where
    I: Iterator<Item = OsString>,
{
    pub fn from_names<N>(names: N) -> Self
    where
        N: IntoIterator<IntoIter = I>,
    {
        Self {
            names: names.into_iter(),
        }
    }
}

impl<I> Iterator for ExtensionEntries<I>
where
    I: Iterator<Item = OsString>,
{
    type Item = ExtensionDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        for file_name in self.names.by_ref() {
            let Some(name) = file_name.to_str() else {
                warn!(entry = ?file_name, "Skipping extension with non UTF-8 name");
                continue;
            };
            if is_dot_entry(name) {
                continue;
            }

            return Some(ExtensionDescriptor::extension(name));
        }
        None
    }
}

/// Start a traversal of `root`.
pub fn discover(root: &Path) -> Result<ExtensionEntries> {
    if root.as_os_str().is_empty() {
        return Err(LoaderError::discovery("extension directory path is empty"));
    }

    let entries = std::fs::read_dir(root).map_err(|e| {
        LoaderError::discovery(format!("Failed to open directory {}: {}", root.display(), e))
    })?;

    Ok(ExtensionEntries::from_names(DirNames {
        root: root.to_path_buf(),
        entries,
    }))
}

/// Outcome of an import pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub failed: Vec<String>,
}

/// Import each descriptor; failures are logged and recorded, never propagated.
pub fn import_descriptors<R, I>(runtime: &R, namespace: &str, descriptors: I) -> ImportReport
where
    R: ForeignRuntime + ?Sized,
    I: IntoIterator<Item = ExtensionDescriptor>,
{
    let mut report = ImportReport::default();

    for descriptor in descriptors {
        let module = descriptor.module_name(namespace);
        debug!(module = %module, "Importing Python extension");
        if runtime.import_module(&module) {
            report.imported.push(module);
        } else {
            warn!(module = %module, "Failed to import Python extension");
            report.failed.push(module);
        }
    }

    report
}

/// Import every extension under `root`, then register the collected addons.
pub fn import_all<R>(runtime: &R, root: &Path, namespace: &str) -> Result<ImportReport>
where
    R: ForeignRuntime + ?Sized,
{
    let entries = discover(root)?;
    let report = import_descriptors(runtime, namespace, entries);

    info!(
        root = %root.display(),
        imported = report.imported.len(),
        failed = report.failed.len(),
        "Loaded Python extensions"
    );

    runtime.run_snippet(REGISTER_ALL_ADDONS_SNIPPET)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionContextToken, RawLockToken};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    #[test]
    fn test_module_name() {
        let descriptor = ExtensionDescriptor::extension("vad");
        assert_eq!(descriptor.module_name("ten_packages"), "ten_packages.extension.vad");

        let group = ExtensionDescriptor::new(AddonKind::ExtensionGroup, "default");
        assert_eq!(group.module_name("ten_packages"), "ten_packages.extension_group.default");
    }

    #[test]
    fn test_addon_kind_parse() {
        for kind in [
            AddonKind::Extension,
            AddonKind::ExtensionGroup,
            AddonKind::Protocol,
            AddonKind::AddonLoader,
        ] {
            assert_eq!(kind.as_str().parse::<AddonKind>().unwrap(), kind);
        }
        assert!("graph".parse::<AddonKind>().is_err());
    }

    /// Runtime whose imports fail for the listed modules.
    struct ImportLog {
        failing: Vec<&'static str>,
        imports: Mutex<Vec<String>>,
        snippets: Mutex<Vec<String>>,
    }

    impl ImportLog {
        fn failing(failing: &[&'static str]) -> Self {
            Self {
                failing: failing.to_vec(),
                imports: Mutex::new(Vec::new()),
                snippets: Mutex::new(Vec::new()),
            }
        }
    }

    impl ForeignRuntime for ImportLog {
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
        fn run_snippet(&self, code: &str) -> Result<()> {
            self.snippets.lock().push(code.to_string());
            Ok(())
        }
        fn search_path(&self) -> Option<String> {
            None
        }
        fn import_module(&self, module: &str) -> bool {
            self.imports.lock().push(module.to_string());
            !self.failing.iter().any(|f| *f == module)
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

    fn names(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_entries_skip_dot_entries() {
        let entries = ExtensionEntries::from_names(names(&[".", "..", "alpha", "beta"]));
        let short: Vec<_> = entries.map(|d| d.short_name).collect();
        assert_eq!(short, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_entries_skip_non_utf8_names() {
        use std::os::unix::ffi::OsStringExt;

        let mut list = names(&["alpha"]);
        list.push(OsString::from_vec(vec![0x66, 0x6f, 0xff]));
        list.push(OsString::from("beta"));

        let short: Vec<_> = ExtensionEntries::from_names(list).map(|d| d.short_name).collect();
        assert_eq!(short, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_failed_import_does_not_stop_traversal() {
        let runtime = ImportLog::failing(&["ten_packages.extension.beta"]);
        let entries = ExtensionEntries::from_names(names(&[".", "..", "alpha", "beta", "gamma"]));

        let report = import_descriptors(&runtime, "ten_packages", entries);
        assert_eq!(
            report.imported,
            vec![
                "ten_packages.extension.alpha".to_string(),
                "ten_packages.extension.gamma".to_string(),
            ]
        );
        assert_eq!(report.failed, vec!["ten_packages.extension.beta".to_string()]);
        assert_eq!(runtime.imports.lock().len(), 3);
    }

    #[test]
    fn test_import_all_registers_after_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();
        let runtime = ImportLog::failing(&["ten_packages.extension.alpha"]);

        let report = import_all(&runtime, dir.path(), "ten_packages").unwrap();
        assert_eq!(report.imported, vec!["ten_packages.extension.beta".to_string()]);
        assert_eq!(report.failed, vec!["ten_packages.extension.alpha".to_string()]);
        assert_eq!(*runtime.snippets.lock(), vec![REGISTER_ALL_ADDONS_SNIPPET.to_string()]);
    }

    #[test]
    fn test_discover_lists_entries_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();

        let first: BTreeSet<_> = discover(dir.path()).unwrap().map(|d| d.short_name).collect();
        let second: BTreeSet<_> = discover(dir.path()).unwrap().map(|d| d.short_name).collect();
        assert_eq!(first, BTreeSet::from(["alpha".to_string(), "beta".to_string()]));
        assert_eq!(first, second);
    }

    #[test]
    fn test_discover_rejects_empty_and_missing_root() {
        assert!(matches!(discover(Path::new("")), Err(LoaderError::DiscoveryFailed(_))));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(discover(&missing), Err(LoaderError::DiscoveryFailed(_))));
    }
}
