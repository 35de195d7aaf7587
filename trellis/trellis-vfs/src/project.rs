//! Project directory service.
//!
//! Maps nodes onto `<projects_root>/<workspace>/<node>` directories and keeps
//! those directories in step with the node's in-memory file list.
//!
//! Writes are additive: files on disk that the node does not track (build
//! output, generated companions, anything the environment tooling drops in)
//! are never deleted.

use crate::exclusion;
use crate::path::RelativePath;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tracing::{debug, info, warn};
use trellis_core::error::{Result, TrellisError};
use trellis_core::naming::sanitize_component;
use trellis_core::types::{Node, ProjectFile};
use walkdir::WalkDir;

/// Report from flushing one node to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub files_written: usize,
    /// Files whose on-disk content already matched
    pub files_unchanged: usize,
    pub bytes_written: usize,
    pub manifest_written: bool,
    pub duration_ms: u64,
}

/// Translates nodes into on-disk project directories.
#[derive(Debug, Clone)]
pub struct ProjectDirectoryService {
    projects_root: PathBuf,
}

impl ProjectDirectoryService {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Directory holding every node of a workspace.
    pub fn workspace_dir(&self, workspace_name: &str) -> PathBuf {
        self.projects_root.join(sanitize_component(workspace_name))
    }

    /// Deterministic project directory for a node. Performs no I/O.
    pub fn project_path(&self, node: &Node, workspace_name: &str) -> PathBuf {
        self.workspace_dir(workspace_name)
            .join(sanitize_component(&node.name))
    }

    /// Ensure the node's project directory exists. Idempotent.
    pub async fn create_project_structure(&self, node: &Node, workspace_name: &str) -> Result<PathBuf> {
        let path = self.project_path(node, workspace_name);
        fs::create_dir_all(&path).await.map_err(|e| {
            TrellisError::filesystem(format!(
                "Failed to create project directory {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(node = %node.id, path = %path.display(), "Project directory ready");
        Ok(path)
    }

    /// Write every tracked file of `node` below `project_path`.
    ///
    /// Paths are validated up front, so an invalid path fails the flush before
    /// anything is written. Each file is replaced atomically; untracked files
    /// are left alone.
    pub async fn save_all_files(&self, node: &Node, project_path: &Path) -> Result<FlushReport> {
        let start = Instant::now();
        let mut report = FlushReport::default();

        let targets = node
            .files
            .iter()
            .map(|file| {
                RelativePath::new(&file.path)
                    .map(|rel| (rel, file))
                    .map_err(|e| {
                        TrellisError::invalid_input(format!(
                            "Invalid file path '{}' in node '{}': {}",
                            file.path, node.name, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        for (relative, file) in targets {
            let physical = relative.to_physical(project_path);
            if write_if_changed(&physical, file.content.as_bytes()).await? {
                report.files_written += 1;
                report.bytes_written += file.content.len();
                debug!("Wrote: {}", physical.display());
            } else {
                report.files_unchanged += 1;
            }
        }

        let descriptor = node.framework.descriptor();
        if let Some(manifest) = descriptor.manifest_file {
            if node.requires_environment() && node.file_by_path(manifest).is_none() {
                let physical = project_path.join(manifest);
                report.manifest_written =
                    write_if_changed(&physical, node.environment_manifest.as_bytes()).await?;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            node = %node.id,
            written = report.files_written,
            unchanged = report.files_unchanged,
            "Flushed node to {}",
            project_path.display()
        );
        Ok(report)
    }

    /// Reload tracked file contents from disk.
    ///
    /// Files missing on disk, or not valid UTF-8, keep their in-memory content.
    pub async fn read_back_files(&self, node: &Node, project_path: &Path) -> Result<Vec<ProjectFile>> {
        let mut files = node.files.clone();
        for file in &mut files {
            let Ok(relative) = RelativePath::new(&file.path) else {
                warn!("Skipping invalid tracked path: {}", file.path);
                continue;
            };
            let physical = relative.to_physical(project_path);
            match fs::read(&physical).await {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => file.content = text,
                    Err(_) => warn!("Not UTF-8, keeping in-memory content: {}", physical.display()),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Not on disk yet: {}", physical.display());
                }
                Err(e) => {
                    return Err(TrellisError::filesystem(format!(
                        "Failed to read {}: {}",
                        physical.display(),
                        e
                    )));
                }
            }
        }
        Ok(files)
    }

    /// Files present under `project_path` that `node` does not track.
    ///
    /// Denylisted directories are skipped. A missing project directory yields
    /// an empty list.
    pub async fn scan_untracked(&self, node: &Node, project_path: &Path) -> Result<Vec<RelativePath>> {
        let root = project_path.to_path_buf();
        let tracked: Vec<String> = node.files.iter().map(|f| f.path.clone()).collect();

        tokio::task::spawn_blocking(move || -> Result<Vec<RelativePath>> {
            if !root.is_dir() {
                return Ok(Vec::new());
            }
            let mut untracked = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_entry(exclusion::keep_entry) {
                let entry = entry.map_err(|e| {
                    TrellisError::filesystem(format!("Failed to walk {}: {}", root.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = RelativePath::from_physical(entry.path(), &root) else {
                    continue;
                };
                if !tracked.iter().any(|t| *t == relative.to_string()) {
                    untracked.push(relative);
                }
            }
            untracked.sort_by_key(|p| p.to_string());
            Ok(untracked)
        })
        .await
        .map_err(|e| TrellisError::concurrency(format!("Scan task failed: {}", e)))?
    }

    /// Reveal the node's project directory in the platform file browser.
    ///
    /// Best effort: failures are logged and reported as `false`.
    pub async fn open_in_file_browser(&self, node: &Node, workspace_name: &str) -> bool {
        let path = node
            .project_path
            .clone()
            .unwrap_or_else(|| self.project_path(node, workspace_name));

        if !path.is_dir() {
            warn!("Project directory does not exist yet: {}", path.display());
            return false;
        }

        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "explorer"
        } else {
            "xdg-open"
        };

        match tokio::process::Command::new(opener).arg(&path).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!("File browser exited abnormally: {}", e);
                    }
                });
                true
            }
            Err(e) => {
                warn!("Failed to launch {} for {}: {}", opener, path.display(), e);
                false
            }
        }
    }
}

/// Atomically replace `path` with `content` unless it already holds exactly that.
///
/// Returns whether anything was written.
pub(crate) async fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool> {
    if let Ok(existing) = fs::read(path).await {
        if blake3::hash(&existing) == blake3::hash(content) {
            return Ok(false);
        }
    }
    write_atomic(path, content).await?;
    Ok(true)
}

/// Write to a sibling temp file, sync it, then rename over the destination.
///
/// A crash leaves either the old content or the new content, never a
/// truncated file. An existing file keeps its permissions.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        TrellisError::filesystem(format!("No parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(parent).await.map_err(|e| {
        TrellisError::filesystem(format!(
            "Failed to create parent directory {}: {}",
            parent.display(),
            e
        ))
    })?;

    let path = path.to_path_buf();
    let parent = parent.to_path_buf();
    let content = content.to_vec();
    tokio::task::spawn_blocking(move || persist_file(&parent, &path, &content))
        .await
        .map_err(|e| TrellisError::concurrency(format!("Write task failed: {}", e)))?
}

fn persist_file(parent: &Path, path: &Path, content: &[u8]) -> Result<()> {
    let write_error =
        |e: std::io::Error| TrellisError::filesystem(format!("Failed to write {}: {}", path.display(), e));

    let mut temp = tempfile::Builder::new()
        .prefix(".trellis-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(write_error)?;
    temp.write_all(content).map_err(write_error)?;

    let permissions = match std::fs::metadata(path) {
        Ok(existing) => Some(existing.permissions()),
        Err(_) => default_permissions(),
    };
    if let Some(permissions) = permissions {
        temp.as_file().set_permissions(permissions).map_err(write_error)?;
    }
    temp.as_file().sync_all().map_err(write_error)?;

    temp.persist(path).map_err(|e| {
        TrellisError::filesystem(format!("Failed to replace {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

#[cfg(unix)]
fn default_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<std::fs::Permissions> {
    None
}
