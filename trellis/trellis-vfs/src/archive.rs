//! Single-file workspace archives.
//!
//! An archive is a deflate zip holding:
//!
//! ```text
//! workspace.json            pretty-printed Workspace metadata
//! code/<node-id>/...        each node's project tree, minus denylisted dirs
//! ```
//!
//! Saving streams into a temporary file next to the destination and renames
//! it into place only once the archive is complete, so an interrupted or
//! failed save leaves the previous archive untouched. Loading extracts into a
//! private staging directory that lives as long as the [`ExtractedArchive`].

use crate::exclusion;
use crate::path::RelativePath;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};
use trellis_core::config::ArchiveConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::framework::Framework;
use trellis_core::id::NodeId;
use trellis_core::types::{Workspace, SCHEMA_VERSION};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Metadata entry at the archive root.
pub const METADATA_FILE: &str = "workspace.json";

/// Directory holding one subdirectory per node, keyed by node id.
pub const CODE_DIR: &str = "code";

/// Statistics from building an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub nodes_archived: usize,
    pub files_archived: usize,
    pub bytes_archived: u64,
    pub duration_ms: u64,
}

/// Per-node line of an [`ArchiveSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub name: String,
    pub framework: Framework,
    /// Files listed in the metadata
    pub tracked_files: usize,
    /// Files stored under the node's code directory
    pub archived_files: usize,
    pub connections: usize,
}

/// What an archive contains, read without extracting it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub name: String,
    pub version: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub modified_at: chrono::DateTime<chrono::Utc>,
    pub nodes: Vec<NodeSummary>,
    pub entries: usize,
    pub archive_bytes: u64,
}

/// Builds and reads workspace archives.
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    compression_level: u32,
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::from_config(&ArchiveConfig::default())
    }
}

impl ArchiveCodec {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(config.compression_level)
    }

    /// Write `workspace` and every node's project tree to `dest`.
    ///
    /// Node trees are read from each node's resolved `project_path`; a node
    /// without one, or whose directory is missing, contributes no code
    /// entries. `dest` is replaced only after the archive is complete.
    pub async fn save(&self, workspace: &Workspace, dest: &Path) -> Result<ArchiveReport> {
        let workspace = workspace.clone();
        let dest = dest.to_path_buf();
        let level = self.compression_level;

        tokio::task::spawn_blocking(move || build_archive(&workspace, &dest, level))
            .await
            .map_err(|e| TrellisError::concurrency(format!("Archive task failed: {}", e)))?
    }

    /// Extract `src` into a staging directory and parse its metadata.
    ///
    /// Any failure to read the container or its metadata is reported as
    /// [`TrellisError::InvalidArchive`].
    pub async fn extract(&self, src: &Path) -> Result<ExtractedArchive> {
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&src))
            .await
            .map_err(|e| TrellisError::concurrency(format!("Extract task failed: {}", e)))?
    }

    /// Read only the workspace metadata of `src`. Nothing is extracted.
    pub async fn read_workspace(&self, src: &Path) -> Result<Workspace> {
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut archive = open_archive(&src)?;
            read_metadata(&mut archive, &src)
        })
        .await
        .map_err(|e| TrellisError::concurrency(format!("Read task failed: {}", e)))?
    }

    /// Summarize an archive from its metadata and entry list.
    pub async fn inspect(&self, src: &Path) -> Result<ArchiveSummary> {
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || inspect_archive(&src))
            .await
            .map_err(|e| TrellisError::concurrency(format!("Inspect task failed: {}", e)))?
    }

    fn file_options(level: u32) -> SimpleFileOptions {
        let options = SimpleFileOptions::default().unix_permissions(0o644);
        // Level 0 means no compression at all
        if level == 0 {
            return options.compression_method(CompressionMethod::Stored);
        }
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level as i64))
    }
}

/// An archive unpacked into a private staging directory.
///
/// The staging directory is removed when this value is dropped.
#[derive(Debug)]
pub struct ExtractedArchive {
    staging: TempDir,
    workspace: Workspace,
}

impl ExtractedArchive {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Staged code directory for a node; may not exist.
    pub fn node_dir(&self, node_id: NodeId) -> PathBuf {
        self.staging
            .path()
            .join(CODE_DIR)
            .join(node_id.to_string())
    }

    /// Copy the node's staged tree over `dest`, creating directories and
    /// overwriting files. Files already in `dest` but not in the archive are
    /// kept. Returns the number of files copied.
    pub async fn restore_node(&self, node_id: NodeId, dest: &Path) -> Result<usize> {
        let source = self.node_dir(node_id);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| TrellisError::concurrency(format!("Restore task failed: {}", e)))?
    }
}

fn build_archive(workspace: &Workspace, dest: &Path, level: u32) -> Result<ArchiveReport> {
    let start = Instant::now();
    let mut report = ArchiveReport::default();

    let metadata = serde_json::to_vec_pretty(workspace)?;

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = NamedTempFile::new_in(&parent).map_err(|e| {
        TrellisError::filesystem(format!(
            "Failed to create temporary archive in {}: {}",
            parent.display(),
            e
        ))
    })?;

    let options = ArchiveCodec::file_options(level);
    let mut writer = ZipWriter::new(temp);

    writer
        .start_file(METADATA_FILE, options)
        .map_err(|e| TrellisError::archive(format!("Failed to add {}: {}", METADATA_FILE, e)))?;
    writer.write_all(&metadata)?;

    for node in &workspace.nodes {
        let Some(root) = node.project_path.as_deref() else {
            debug!(node = %node.id, "No project directory resolved, archiving metadata only");
            continue;
        };
        if !root.is_dir() {
            debug!(node = %node.id, "Project directory missing: {}", root.display());
            continue;
        }

        let prefix = format!("{}/{}", CODE_DIR, node.id);
        writer
            .add_directory(format!("{}/", prefix), options)
            .map_err(|e| TrellisError::archive(format!("Failed to add {}: {}", prefix, e)))?;

        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(exclusion::keep_entry)
        {
            let entry = entry.map_err(|e| {
                TrellisError::filesystem(format!("Failed to walk {}: {}", root.display(), e))
            })?;
            if entry.depth() == 0 {
                continue;
            }

            let relative = RelativePath::from_physical(entry.path(), root).map_err(|e| {
                TrellisError::archive(format!("Cannot archive {}: {}", entry.path().display(), e))
            })?;
            let name = format!("{}/{}", prefix, relative);

            let file_type = entry.file_type();
            if file_type.is_dir() {
                writer
                    .add_directory(format!("{}/", name), options)
                    .map_err(|e| TrellisError::archive(format!("Failed to add {}: {}", name, e)))?;
            } else if file_type.is_file() {
                let mut source = File::open(entry.path()).map_err(|e| {
                    TrellisError::filesystem(format!("Failed to read {}: {}", entry.path().display(), e))
                })?;
                writer
                    .start_file(name.as_str(), options)
                    .map_err(|e| TrellisError::archive(format!("Failed to add {}: {}", name, e)))?;
                report.bytes_archived += io::copy(&mut source, &mut writer)?;
                report.files_archived += 1;
            } else {
                debug!("Skipping non-regular file: {}", entry.path().display());
            }
        }
        report.nodes_archived += 1;
    }

    let temp = writer
        .finish()
        .map_err(|e| TrellisError::archive(format!("Failed to finish archive: {}", e)))?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|e| {
        TrellisError::filesystem(format!("Failed to replace {}: {}", dest.display(), e.error))
    })?;

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        nodes = report.nodes_archived,
        files = report.files_archived,
        bytes = report.bytes_archived,
        "Archive written to {}",
        dest.display()
    );
    Ok(report)
}

fn open_archive(src: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(src).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            TrellisError::not_found("archive", src.display().to_string())
        } else {
            TrellisError::filesystem(format!("Failed to open {}: {}", src.display(), e))
        }
    })?;
    ZipArchive::new(file).map_err(|e| TrellisError::invalid_archive(format!("{}: {}", src.display(), e)))
}

fn extract_archive(src: &Path) -> Result<ExtractedArchive> {
    let mut archive = open_archive(src)?;
    let staging = TempDir::new().map_err(|e| {
        TrellisError::filesystem(format!("Failed to create staging directory: {}", e))
    })?;

    let mut skipped = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| TrellisError::invalid_archive(format!("Corrupt entry #{}: {}", index, e)))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(TrellisError::invalid_archive(format!(
                "Unsafe entry name: {}",
                entry.name()
            )));
        };

        let in_code = relative.starts_with(CODE_DIR);
        if !in_code && relative != Path::new(METADATA_FILE) {
            debug!("Ignoring unexpected entry: {}", relative.display());
            continue;
        }

        let excluded = if entry.is_dir() {
            relative
                .components()
                .any(|c| c.as_os_str().to_str().is_some_and(exclusion::is_excluded_name))
        } else {
            exclusion::has_excluded_component(&relative)
        };
        if excluded {
            skipped += 1;
            continue;
        }

        let target = staging.path().join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| TrellisError::invalid_archive(format!("Failed to extract {}: {}", relative.display(), e)))?;
    }
    if skipped > 0 {
        warn!("Skipped {} denylisted entries in {}", skipped, src.display());
    }

    let metadata_path = staging.path().join(METADATA_FILE);
    let metadata = std::fs::read(&metadata_path)
        .map_err(|_| TrellisError::invalid_archive(format!("{} has no {}", src.display(), METADATA_FILE)))?;
    let workspace = parse_metadata(&metadata)?;

    info!(
        nodes = workspace.nodes.len(),
        "Extracted archive {}",
        src.display()
    );
    Ok(ExtractedArchive { staging, workspace })
}

fn inspect_archive(src: &Path) -> Result<ArchiveSummary> {
    let archive_bytes = std::fs::metadata(src).map(|m| m.len()).unwrap_or(0);
    let mut archive = open_archive(src)?;

    let workspace = read_metadata(&mut archive, src)?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let nodes = workspace
        .nodes
        .iter()
        .map(|node| {
            let prefix = format!("{}/{}/", CODE_DIR, node.id);
            NodeSummary {
                id: node.id,
                name: node.name.clone(),
                framework: node.framework,
                tracked_files: node.files.len(),
                archived_files: names
                    .iter()
                    .filter(|n| n.starts_with(&prefix) && !n.ends_with('/'))
                    .count(),
                connections: node.connections.len(),
            }
        })
        .collect();

    Ok(ArchiveSummary {
        name: workspace.name,
        version: workspace.version,
        created_at: workspace.created_at,
        modified_at: workspace.modified_at,
        nodes,
        entries: names.len(),
        archive_bytes,
    })
}

fn read_metadata(archive: &mut ZipArchive<File>, src: &Path) -> Result<Workspace> {
    let mut entry = archive
        .by_name(METADATA_FILE)
        .map_err(|_| TrellisError::invalid_archive(format!("{} has no {}", src.display(), METADATA_FILE)))?;
    let mut buffer = Vec::new();
    io::copy(&mut entry, &mut buffer)
        .map_err(|e| TrellisError::invalid_archive(format!("Unreadable {}: {}", METADATA_FILE, e)))?;
    parse_metadata(&buffer)
}

fn parse_metadata(bytes: &[u8]) -> Result<Workspace> {
    let workspace: Workspace = serde_json::from_slice(bytes)
        .map_err(|e| TrellisError::invalid_archive(format!("Malformed {}: {}", METADATA_FILE, e)))?;

    if major_version(&workspace.version) != major_version(SCHEMA_VERSION) {
        return Err(TrellisError::invalid_archive(format!(
            "Unsupported workspace version {} (expected {})",
            workspace.version, SCHEMA_VERSION
        )));
    }
    Ok(workspace)
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest).map_err(|e| {
        TrellisError::filesystem(format!("Failed to create {}: {}", dest.display(), e))
    })?;
    if !source.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).into_iter().filter_entry(exclusion::keep_entry) {
        let entry = entry.map_err(|e| {
            TrellisError::filesystem(format!("Failed to walk {}: {}", source.display(), e))
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| {
                TrellisError::filesystem(format!("Failed to create {}: {}", target.display(), e))
            })?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                TrellisError::filesystem(format!("Failed to restore {}: {}", target.display(), e))
            })?;
            copied += 1;
        }
    }
    debug!("Restored {} files into {}", copied, dest.display());
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::{Node, NodeKind};

    fn workspace_with_tree(root: &Path) -> Workspace {
        let mut node = Node::new("api", NodeKind::Backend, Framework::Go);
        let dir = root.join("api");
        std::fs::create_dir_all(dir.join("cmd")).unwrap();
        std::fs::write(dir.join("main.go"), "package main").unwrap();
        std::fs::write(dir.join("cmd/tool.go"), "package cmd").unwrap();
        node.project_path = Some(dir);

        let mut workspace = Workspace::new("Demo");
        workspace.nodes.push(node);
        workspace
    }

    #[tokio::test]
    async fn test_save_and_extract() {
        let temp = TempDir::new().unwrap();
        let workspace = workspace_with_tree(temp.path());
        let node_id = workspace.nodes[0].id;
        let dest = temp.path().join("demo.trellis");

        let codec = ArchiveCodec::default();
        let report = codec.save(&workspace, &dest).await.unwrap();
        assert_eq!(report.nodes_archived, 1);
        assert_eq!(report.files_archived, 2);

        let extracted = codec.extract(&dest).await.unwrap();
        assert_eq!(extracted.workspace().name, "Demo");
        assert!(extracted.node_dir(node_id).join("cmd/tool.go").is_file());

        let restore_to = temp.path().join("restored");
        let copied = extracted.restore_node(node_id, &restore_to).await.unwrap();
        assert_eq!(copied, 2);
        assert_eq!(
            std::fs::read_to_string(restore_to.join("main.go")).unwrap(),
            "package main"
        );
    }

    #[tokio::test]
    async fn test_read_workspace_leaves_disk_alone() {
        let temp = TempDir::new().unwrap();
        let workspace = workspace_with_tree(temp.path());
        let dest = temp.path().join("demo.trellis");
        let codec = ArchiveCodec::default();
        codec.save(&workspace, &dest).await.unwrap();

        std::fs::write(temp.path().join("api/main.go"), "package main // edited").unwrap();
        let read = codec.read_workspace(&dest).await.unwrap();
        assert_eq!(read.nodes.len(), 1);
        assert_eq!(read.nodes[0].id, workspace.nodes[0].id);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("api/main.go")).unwrap(),
            "package main // edited"
        );

        let missing = codec.read_workspace(&temp.path().join("nope.trellis")).await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_metadata_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let workspace = workspace_with_tree(temp.path());
        let first = serde_json::to_vec_pretty(&workspace).unwrap();
        let second = serde_json::to_vec_pretty(&workspace.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_project_dir_archives_metadata_only() {
        let temp = TempDir::new().unwrap();
        let mut workspace = Workspace::new("Sparse");
        let mut node = Node::new("ghost", NodeKind::Service, Framework::Rust);
        node.project_path = Some(temp.path().join("does-not-exist"));
        workspace.nodes.push(node);

        let dest = temp.path().join("sparse.trellis");
        let codec = ArchiveCodec::default();
        let report = codec.save(&workspace, &dest).await.unwrap();
        assert_eq!(report.nodes_archived, 0);

        let summary = codec.inspect(&dest).await.unwrap();
        assert_eq!(summary.nodes.len(), 1);
        assert_eq!(summary.nodes[0].tracked_files, 1);
        assert_eq!(summary.nodes[0].archived_files, 0);
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("garbage.trellis");
        std::fs::write(&src, b"definitely not a zip file").unwrap();

        let err = ArchiveCodec::default().extract(&src).await.unwrap_err();
        assert!(err.is_invalid_archive());
    }

    #[tokio::test]
    async fn test_zip_without_metadata_is_invalid_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("plain.zip");
        {
            let mut writer = ZipWriter::new(File::create(&src).unwrap());
            writer
                .start_file("readme.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }

        let err = ArchiveCodec::default().extract(&src).await.unwrap_err();
        assert!(err.is_invalid_archive());
    }

    #[tokio::test]
    async fn test_incompatible_version_is_invalid_archive() {
        let mut workspace = Workspace::new("Future");
        workspace.version = "2.0".to_string();
        let bytes = serde_json::to_vec(&workspace).unwrap();
        assert!(parse_metadata(&bytes).unwrap_err().is_invalid_archive());

        workspace.version = "1.7".to_string();
        let bytes = serde_json::to_vec(&workspace).unwrap();
        assert!(parse_metadata(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_missing_archive_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = ArchiveCodec::default()
            .extract(&temp.path().join("absent.trellis"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
