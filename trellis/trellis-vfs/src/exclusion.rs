//! Directory denylist shared by archive save and load.
//!
//! These directories hold regenerable or machine-specific state (dependency
//! caches, virtual environments, build output, version-control metadata).
//! They are never archived and never restored; the environment provisioner
//! recreates them on demand. The list is part of the archive format: entries
//! may be added in later versions, never removed.

use std::ffi::OsStr;
use std::path::Path;
use walkdir::DirEntry;

/// Directory names excluded from archives, matched exactly.
pub const EXCLUDED_DIRECTORIES: &[&str] = &[
    // Dependency caches
    "node_modules",
    "bower_components",
    // Virtual environments
    ".venv",
    "venv",
    // Compiled artifacts and tool caches
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    // Build output
    "build",
    "dist",
    "out",
    ".build",
    "target",
    "DerivedData",
    "Pods",
    ".gradle",
    ".next",
    ".nuxt",
    ".dart_tool",
    // Version control
    ".git",
    ".hg",
    ".svn",
];

/// Whether a single directory name is on the denylist.
pub fn is_excluded_name(name: &str) -> bool {
    EXCLUDED_DIRECTORIES.contains(&name)
}

fn is_excluded_os(name: &OsStr) -> bool {
    name.to_str().is_some_and(is_excluded_name)
}

/// `walkdir` filter: `false` for denylisted directories so the walk prunes
/// them without descending.
pub fn keep_entry(entry: &DirEntry) -> bool {
    !(entry.file_type().is_dir() && entry.depth() > 0 && is_excluded_os(entry.file_name()))
}

/// Whether any directory component of `relative` is denylisted.
///
/// The last component is treated as a file name and not checked, so a file
/// that happens to be called `build` is kept.
pub fn has_excluded_component(relative: &Path) -> bool {
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        if is_excluded_os(component.as_os_str()) {
            return true;
        }
    }
    false
}
