//! CLI command implementations.
//!
//! Read-only commands look at the archive metadata and never touch project
//! directories. Every command that changes a workspace opens the archive
//! through the orchestrator, keeping existing project directories and reading
//! their tracked files back, applies the change, waits for the node
//! directories to settle and saves the archive back in place.

use crate::output::{self, format_bytes, format_timestamp, OutputFormat, TableBuilder};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use trellis_core::prelude::*;
use trellis_core::FRAMEWORKS;
use trellis_vfs::{
    ArchiveCodec, LoadReport, ProjectDirectoryService, RestorePolicy, SyncOrchestrator, SyncServices,
};

// ============================================================================
// Session helpers
// ============================================================================

fn start_orchestrator(config: &TrellisConfig, name: &str) -> Result<SyncOrchestrator> {
    let services = SyncServices::from_config(config).context("Failed to set up sync services")?;
    let (orchestrator, _owner) = SyncOrchestrator::spawn(NodeGraphStore::new(name), services);
    Ok(orchestrator)
}

/// Load `archive` into a fresh orchestrator for editing.
///
/// Project directories already on disk win over the archived trees.
async fn open_workspace(config: &TrellisConfig, archive: &Path) -> Result<(SyncOrchestrator, LoadReport)> {
    let orchestrator = start_orchestrator(config, &config.workspace.default_name)?;
    let report = orchestrator
        .load_with(archive, RestorePolicy::KeepExisting)
        .await
        .with_context(|| format!("Failed to open workspace {}", archive.display()))?;
    Ok((orchestrator, report))
}

/// Read the archive metadata without touching any project directory.
async fn read_workspace(config: &TrellisConfig, archive: &Path) -> Result<Workspace> {
    ArchiveCodec::from_config(&config.archive)
        .read_workspace(archive)
        .await
        .with_context(|| format!("Failed to open workspace {}", archive.display()))
}

/// Wait for background syncing, then write the archive back.
async fn save_workspace(orchestrator: &SyncOrchestrator, archive: &Path, format: OutputFormat) -> Result<()> {
    let spinner = output::spinner("Saving workspace...", format);
    orchestrator.wait_idle().await;
    let result = orchestrator.save(archive).await;
    spinner.finish_and_clear();

    let report = result.with_context(|| format!("Failed to save workspace {}", archive.display()))?;
    tracing::debug!(
        nodes = report.nodes_flushed,
        written = report.files_written,
        "Saved in {}ms",
        report.duration_ms
    );
    Ok(())
}

/// Resolve a node by full id, exact name (case-insensitive) or unique id prefix.
pub fn resolve_node(workspace: &Workspace, reference: &str) -> Result<NodeId> {
    if let Ok(id) = NodeId::parse(reference) {
        if workspace.node(id).is_some() {
            return Ok(id);
        }
    }

    if let Some(node) = workspace
        .nodes
        .iter()
        .find(|n| n.name.eq_ignore_ascii_case(reference))
    {
        return Ok(node.id);
    }

    let prefix = reference.to_lowercase();
    let matches: Vec<&Node> = workspace
        .nodes
        .iter()
        .filter(|n| !prefix.is_empty() && n.id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [node] => Ok(node.id),
        [] => bail!("No node named or identified by '{}'", reference),
        _ => bail!("'{}' matches {} nodes; use a longer id", reference, matches.len()),
    }
}

// ============================================================================
// Init Command
// ============================================================================

/// Create a new, empty workspace archive
pub async fn init_workspace(
    config: &TrellisConfig,
    archive: PathBuf,
    name: Option<String>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let archive = if archive.extension().is_none() {
        archive.with_extension(&config.archive.extension)
    } else {
        archive
    };
    if archive.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            archive.display()
        );
    }

    let name = name.unwrap_or_else(|| config.workspace.default_name.clone());
    let orchestrator = start_orchestrator(config, &name)?;
    save_workspace(&orchestrator, &archive, format).await?;
    orchestrator.shutdown();

    if format.is_json() {
        output::output(&serde_json::json!({ "name": name, "archive": archive }))?;
    } else {
        output::success(format!("Created workspace '{}' at {}", name, archive.display()));
    }
    Ok(())
}

// ============================================================================
// Node Commands
// ============================================================================

#[derive(Debug, Serialize)]
struct NodeRow {
    id: NodeId,
    name: String,
    kind: NodeKind,
    framework: Framework,
    files: usize,
    connections: Vec<NodeId>,
}

impl From<&Node> for NodeRow {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            kind: node.kind,
            framework: node.framework,
            files: node.files.len(),
            connections: node.connections.clone(),
        }
    }
}

/// Add a node to a workspace
#[allow(clippy::too_many_arguments)]
pub async fn node_add(
    config: &TrellisConfig,
    archive: PathBuf,
    name: String,
    framework: Framework,
    kind: NodeKind,
    x: f64,
    y: f64,
    format: OutputFormat,
) -> Result<()> {
    let (orchestrator, _) = open_workspace(config, &archive).await?;

    let node = Node::new(name, kind, framework).with_position(Position::new(x, y));
    let id = orchestrator
        .add_node(node)
        .await
        .context("Failed to add node")?;
    save_workspace(&orchestrator, &archive, format).await?;

    let node = orchestrator
        .node(id)
        .await?
        .context("Node disappeared after being added")?;
    orchestrator.shutdown();

    if format.is_json() {
        output::output(&NodeRow::from(&node))?;
    } else {
        output::success(format!("Added node '{}' ({})", node.name, id.short()));
        if let Some(path) = &node.project_path {
            output::kv("Project", path.display());
        }
        if let Some(entry) = node.entry_file() {
            output::kv("Entry file", &entry.path);
        }
    }
    Ok(())
}

/// Remove a node and its connections; the project directory is kept
pub async fn node_remove(
    config: &TrellisConfig,
    archive: PathBuf,
    reference: String,
    format: OutputFormat,
) -> Result<()> {
    let (orchestrator, _) = open_workspace(config, &archive).await?;
    let workspace = orchestrator.snapshot().await?;
    let id = resolve_node(&workspace, &reference)?;

    let removed = orchestrator
        .remove_node(id)
        .await
        .context("Failed to remove node")?;
    save_workspace(&orchestrator, &archive, format).await?;
    orchestrator.shutdown();

    if format.is_json() {
        output::output(&NodeRow::from(&removed))?;
    } else {
        output::success(format!("Removed node '{}'", removed.name));
        if let Some(path) = removed.project_path {
            output::info(format!("Project directory left in place: {}", path.display()));
        }
    }
    Ok(())
}

/// List the nodes of a workspace
pub async fn node_list(config: &TrellisConfig, archive: PathBuf, format: OutputFormat) -> Result<()> {
    let workspace = read_workspace(config, &archive).await?;

    if format.is_json() {
        let rows: Vec<NodeRow> = workspace.nodes.iter().map(NodeRow::from).collect();
        return output::output(&rows);
    }

    if workspace.nodes.is_empty() {
        output::info("No nodes yet. Add one with 'trellis node add'");
        return Ok(());
    }

    let mut table = TableBuilder::new().header(vec!["ID", "Name", "Kind", "Framework", "Files", "Links"]);
    for node in &workspace.nodes {
        let links = node
            .connections
            .iter()
            .filter_map(|id| workspace.node(*id))
            .map(|n| n.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        table = table.row(vec![
            node.id.short(),
            node.name.clone(),
            node.kind.as_str().to_string(),
            node.framework.to_string(),
            node.files.len().to_string(),
            links,
        ]);
    }
    table.print();
    Ok(())
}

/// Show one node in detail
pub async fn node_show(
    config: &TrellisConfig,
    archive: PathBuf,
    reference: String,
    format: OutputFormat,
) -> Result<()> {
    let workspace = read_workspace(config, &archive).await?;
    let id = resolve_node(&workspace, &reference)?;
    let node = workspace
        .node(id)
        .context("Node disappeared while loading")?;

    let directories = ProjectDirectoryService::new(&config.workspace.projects_dir);
    let project_path = directories.project_path(node, &workspace.name);
    let on_disk = project_path.is_dir();
    let untracked = directories
        .scan_untracked(node, &project_path)
        .await
        .context("Failed to scan project directory")?;

    if format.is_json() {
        let untracked: Vec<String> = untracked.iter().map(ToString::to_string).collect();
        return output::output(&serde_json::json!({
            "node": node,
            "project_path": project_path,
            "on_disk": on_disk,
            "untracked": untracked,
        }));
    }

    output::header(&node.name);
    output::kv("ID", node.id);
    output::kv("Kind", node.kind.as_str());
    output::kv("Framework", node.framework.descriptor().display_name);
    output::kv("Position", format!("({}, {})", node.position.x, node.position.y));
    if on_disk {
        output::kv("Project", project_path.display());
    } else {
        output::kv(
            "Project",
            format!("{} (missing, run 'trellis restore')", project_path.display()),
        );
    }

    let mut table = TableBuilder::new().header(vec!["Path", "Language", "Size"]);
    for file in &node.files {
        table = table.row(vec![
            file.path.clone(),
            format!("{:?}", file.language),
            format_bytes(file.content.len() as u64),
        ]);
    }
    table.print();

    let outgoing: Vec<String> = node
        .connections
        .iter()
        .filter_map(|id| workspace.node(*id))
        .map(|n| n.name.clone())
        .collect();
    if !outgoing.is_empty() {
        output::kv("Connects to", outgoing.join(", "));
    }

    if !untracked.is_empty() {
        output::header("Untracked files");
        for path in &untracked {
            println!("  {}", path);
        }
    }
    Ok(())
}

/// Reveal a node's project directory in the file browser
pub async fn node_open(config: &TrellisConfig, archive: PathBuf, reference: String) -> Result<()> {
    let workspace = read_workspace(config, &archive).await?;
    let id = resolve_node(&workspace, &reference)?;
    let node = workspace
        .node(id)
        .context("Node disappeared while loading")?;

    let directories = ProjectDirectoryService::new(&config.workspace.projects_dir);
    if directories.open_in_file_browser(node, &workspace.name).await {
        output::success("Opened project directory");
    } else {
        output::warning("Could not open a file browser; see the log for details");
    }
    Ok(())
}

// ============================================================================
// Connection Commands
// ============================================================================

/// Connect two nodes
pub async fn connect(
    config: &TrellisConfig,
    archive: PathBuf,
    from: String,
    to: String,
    format: OutputFormat,
) -> Result<()> {
    let workspace = read_workspace(config, &archive).await?;
    let from_id = resolve_node(&workspace, &from)?;
    let to_id = resolve_node(&workspace, &to)?;

    let already = workspace
        .node(from_id)
        .is_some_and(|n| n.is_connected_to(to_id));
    let added = if already {
        false
    } else {
        let (orchestrator, _) = open_workspace(config, &archive).await?;
        let added = orchestrator
            .add_connection(from_id, to_id)
            .await
            .context("Failed to connect nodes")?;
        if added {
            save_workspace(&orchestrator, &archive, format).await?;
        }
        orchestrator.shutdown();
        added
    };

    if format.is_json() {
        output::output(&serde_json::json!({ "from": from_id, "to": to_id, "added": added }))?;
    } else if added {
        output::success(format!("Connected {} → {}", from, to));
    } else {
        output::info(format!("{} is already connected to {}", from, to));
    }
    Ok(())
}

/// Disconnect two nodes
pub async fn disconnect(
    config: &TrellisConfig,
    archive: PathBuf,
    from: String,
    to: String,
    format: OutputFormat,
) -> Result<()> {
    let workspace = read_workspace(config, &archive).await?;
    let from_id = resolve_node(&workspace, &from)?;
    let to_id = resolve_node(&workspace, &to)?;

    let connected = workspace
        .node(from_id)
        .is_some_and(|n| n.is_connected_to(to_id));
    let removed = if connected {
        let (orchestrator, _) = open_workspace(config, &archive).await?;
        let removed = orchestrator.remove_connection(from_id, to_id).await?;
        if removed {
            save_workspace(&orchestrator, &archive, format).await?;
        }
        orchestrator.shutdown();
        removed
    } else {
        false
    };

    if format.is_json() {
        output::output(&serde_json::json!({ "from": from_id, "to": to_id, "removed": removed }))?;
    } else if removed {
        output::success(format!("Disconnected {} → {}", from, to));
    } else {
        output::info(format!("{} was not connected to {}", from, to));
    }
    Ok(())
}

// ============================================================================
// Archive Commands
// ============================================================================

/// Capture edits made inside project directories into the archive
pub async fn sync(config: &TrellisConfig, archive: PathBuf, format: OutputFormat) -> Result<()> {
    let (orchestrator, loaded) = open_workspace(config, &archive).await?;
    save_workspace(&orchestrator, &archive, format).await?;
    orchestrator.shutdown();

    if format.is_json() {
        return output::output(&serde_json::json!({
            "workspace": loaded.workspace_name,
            "nodes": loaded.nodes,
            "nodes_reloaded": loaded.nodes_reloaded,
            "files_restored": loaded.files_restored,
        }));
    }

    output::success(format!(
        "Synced '{}': {} of {} nodes read from disk",
        loaded.workspace_name, loaded.nodes_reloaded, loaded.nodes
    ));
    if loaded.files_restored > 0 {
        output::info(format!(
            "Restored {} files into missing project directories",
            loaded.files_restored
        ));
    }
    Ok(())
}

/// Summarize an archive without extracting it
pub async fn inspect(config: &TrellisConfig, archive: PathBuf, format: OutputFormat) -> Result<()> {
    let summary = ArchiveCodec::from_config(&config.archive)
        .inspect(&archive)
        .await
        .with_context(|| format!("Failed to inspect {}", archive.display()))?;

    if format.is_json() {
        return output::output(&summary);
    }

    output::header(&summary.name);
    output::kv("Version", &summary.version);
    output::kv("Created", format_timestamp(summary.created_at));
    output::kv("Modified", format_timestamp(summary.modified_at));
    output::kv("Entries", summary.entries);
    output::kv("Size", format_bytes(summary.archive_bytes));

    let mut table =
        TableBuilder::new().header(vec!["ID", "Name", "Framework", "Tracked", "Archived", "Links"]);
    for node in &summary.nodes {
        table = table.row(vec![
            node.id.short(),
            node.name.clone(),
            node.framework.to_string(),
            node.tracked_files.to_string(),
            node.archived_files.to_string(),
            node.connections.to_string(),
        ]);
    }
    table.print();
    Ok(())
}

/// Restore every node's project directory from an archive
pub async fn restore(config: &TrellisConfig, archive: PathBuf, format: OutputFormat) -> Result<()> {
    let spinner = output::spinner("Restoring workspace...", format);
    let orchestrator = start_orchestrator(config, &config.workspace.default_name)?;
    let result = orchestrator.load(&archive).await;
    if result.is_ok() {
        orchestrator.wait_idle().await;
    }
    spinner.finish_and_clear();
    let report = result.with_context(|| format!("Failed to restore {}", archive.display()))?;

    let workspace = orchestrator.snapshot().await?;
    let mut failed = Vec::new();
    for node in &workspace.nodes {
        if orchestrator.node_state(node.id).await? == Some(NodeSyncState::Failed) {
            failed.push(node.name.clone());
        }
    }
    orchestrator.shutdown();

    if format.is_json() {
        return output::output(&serde_json::json!({
            "workspace": report.workspace_name,
            "nodes": report.nodes,
            "connections": report.connections,
            "files_restored": report.files_restored,
            "failed": failed,
            "projects_dir": config.workspace.projects_dir,
        }));
    }

    output::success(format!(
        "Restored '{}': {} nodes, {} files",
        report.workspace_name, report.nodes, report.files_restored
    ));
    output::kv("Projects", config.workspace.projects_dir.display());
    for name in failed {
        output::warning(format!("Node '{}' could not be synced", name));
    }
    Ok(())
}

// ============================================================================
// Info Commands
// ============================================================================

#[derive(Debug, Serialize)]
struct FrameworkRow {
    tag: &'static str,
    name: &'static str,
    entry: &'static str,
    environment: bool,
    manifest: Option<&'static str>,
}

/// List supported frameworks
pub fn frameworks(format: OutputFormat) -> Result<()> {
    let rows: Vec<FrameworkRow> = FRAMEWORKS
        .iter()
        .map(|d| FrameworkRow {
            tag: d.tag,
            name: d.display_name,
            entry: d.entry_path,
            environment: d.requires_environment,
            manifest: d.manifest_file,
        })
        .collect();

    if format.is_json() {
        return output::output(&rows);
    }

    let mut table = TableBuilder::new().header(vec!["Tag", "Name", "Entry file", "Environment"]);
    for row in &rows {
        table = table.row(vec![
            row.tag.to_string(),
            row.name.to_string(),
            row.entry.to_string(),
            row.manifest.map_or_else(|| "-".to_string(), |m| format!("yes ({})", m)),
        ]);
    }
    table.print();
    Ok(())
}

/// Print the effective configuration
pub fn config_show(config: &TrellisConfig, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return output::output(config);
    }

    if let Ok(path) = TrellisConfig::config_path() {
        output::kv("Config file", path.display());
    }
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("\n{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        let mut workspace = Workspace::new("test");
        workspace
            .nodes
            .push(Node::new("Api", NodeKind::Backend, Framework::Go));
        workspace
            .nodes
            .push(Node::new("web", NodeKind::Frontend, Framework::React));
        workspace
    }

    #[test]
    fn test_resolve_by_name_and_id() {
        let workspace = workspace();
        let api = workspace.nodes[0].id;

        assert_eq!(resolve_node(&workspace, "api").unwrap(), api);
        assert_eq!(resolve_node(&workspace, &api.to_string()).unwrap(), api);
        assert_eq!(resolve_node(&workspace, &api.short()).unwrap(), api);
    }

    #[test]
    fn test_resolve_unknown() {
        let workspace = workspace();
        assert!(resolve_node(&workspace, "nope").is_err());
        assert!(resolve_node(&workspace, "").is_err());
    }
}
