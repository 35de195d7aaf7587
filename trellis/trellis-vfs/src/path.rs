//! Project-relative paths.
//!
//! A [`RelativePath`] is how a tracked file is addressed inside its node's
//! project root. It is independent of where the project lives on disk and can
//! never climb out of the root, so joining it onto a project directory always
//! stays inside that directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A `/`-separated path relative to a project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePath {
    segments: Vec<String>,
}

impl RelativePath {
    /// Parse and normalize a project-relative path.
    ///
    /// Backslashes are treated as separators, `.` segments and leading slashes
    /// are dropped, and `..` is resolved. A path that would escape the root or
    /// that names nothing is rejected.
    pub fn new(path: &str) -> Result<Self, RelativePathError> {
        let path = path.trim().replace('\\', "/");

        let mut segments: Vec<String> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    if segments.pop().is_none() {
                        return Err(RelativePathError::EscapesRoot);
                    }
                }
                s => {
                    if let Some(c) = s.chars().find(|c| *c == '\0' || *c == ':') {
                        return Err(RelativePathError::InvalidCharacter(c));
                    }
                    segments.push(s.to_string());
                }
            }
        }

        if segments.is_empty() {
            return Err(RelativePathError::Empty);
        }

        Ok(Self { segments })
    }

    /// Build from a physical path below `base`.
    pub fn from_physical(physical: &Path, base: &Path) -> Result<Self, RelativePathError> {
        let relative = physical
            .strip_prefix(base)
            .map_err(|_| RelativePathError::NotRelativeTo(base.to_path_buf()))?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    parts.push(part.to_str().ok_or(RelativePathError::InvalidUtf8)?);
                }
                Component::CurDir => {}
                _ => return Err(RelativePathError::EscapesRoot),
            }
        }

        Self::new(&parts.join("/"))
    }

    /// Resolve against a physical project root.
    pub fn to_physical(&self, base: &Path) -> PathBuf {
        let mut physical = base.to_path_buf();
        for segment in &self.segments {
            physical.push(segment);
        }
        physical
    }

    pub fn file_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Parent directory, `None` for a top-level file.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether any directory segment satisfies `predicate`.
    pub fn any_directory(&self, predicate: impl Fn(&str) -> bool) -> bool {
        self.segments[..self.segments.len() - 1]
            .iter()
            .any(|s| predicate(s))
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Errors that can occur when parsing project-relative paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelativePathError {
    #[error("Invalid character in path: {0:?}")]
    InvalidCharacter(char),

    #[error("Path is not relative to base: {0}")]
    NotRelativeTo(PathBuf),

    #[error("Path contains invalid UTF-8")]
    InvalidUtf8,

    #[error("Path escapes project root")]
    EscapesRoot,

    #[error("Path is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_path() {
        let path = RelativePath::new("src/main.rs").unwrap();
        assert_eq!(path.segments(), &["src", "main.rs"]);
        assert_eq!(path.to_string(), "src/main.rs");
    }

    #[test]
    fn test_normalization() {
        let path = RelativePath::new("/src/./lib/../main.rs").unwrap();
        assert_eq!(path.to_string(), "src/main.rs");

        let path = RelativePath::new("src\\windows\\style.rs").unwrap();
        assert_eq!(path.to_string(), "src/windows/style.rs");
    }

    #[test]
    fn test_escape_rejected() {
        assert_eq!(RelativePath::new("../etc/passwd"), Err(RelativePathError::EscapesRoot));
        assert_eq!(RelativePath::new("a/../../b"), Err(RelativePathError::EscapesRoot));
    }

    #[test]
    fn test_empty_and_invalid() {
        assert_eq!(RelativePath::new("  "), Err(RelativePathError::Empty));
        assert_eq!(RelativePath::new("a/.."), Err(RelativePathError::Empty));
        assert_eq!(RelativePath::new("C:/x"), Err(RelativePathError::InvalidCharacter(':')));
    }

    #[test]
    fn test_parent_and_file_name() {
        let path = RelativePath::new("src/lib/mod.rs").unwrap();
        assert_eq!(path.file_name(), "mod.rs");
        assert_eq!(path.parent().unwrap().to_string(), "src/lib");
        assert!(RelativePath::new("main.rs").unwrap().parent().is_none());
    }

    #[test]
    fn test_physical_roundtrip() {
        let base = Path::new("/home/user/project");
        let rel = RelativePath::new("src/main.rs").unwrap();
        let physical = rel.to_physical(base);
        assert_eq!(physical, PathBuf::from("/home/user/project/src/main.rs"));
        assert_eq!(RelativePath::from_physical(&physical, base).unwrap(), rel);
    }

    #[test]
    fn test_any_directory_ignores_file_name() {
        let path = RelativePath::new("node_modules/x/index.js").unwrap();
        assert!(path.any_directory(|s| s == "node_modules"));

        let path = RelativePath::new("src/build").unwrap();
        assert!(!path.any_directory(|s| s == "build"));
    }
}
