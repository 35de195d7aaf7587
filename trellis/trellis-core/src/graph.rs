//! In-memory node graph.
//!
//! [`NodeGraphStore`] is the single source of truth for nodes and edges. It is
//! a plain value with synchronous `&mut self` operations; exactly one owner
//! holds it (see the orchestrator in `trellis-vfs`), and disk work happens on
//! snapshots handed out by [`NodeGraphStore::node`] and
//! [`NodeGraphStore::snapshot`].

use crate::error::{Result, TrellisError};
use crate::id::NodeId;
use crate::naming::collision_key;
use crate::types::{CanvasState, Connection, Node, Workspace, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

/// What changed between two versions of a node.
///
/// Produced by [`NodeGraphStore::update_node`]; the orchestrator turns it into
/// directory, flush and environment work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChange {
    pub framework_changed: bool,
    pub renamed: bool,
    /// Project path unset, changed, or invalidated by a rename
    pub project_path_changed: bool,
    /// Switched from a framework without an environment to one with
    pub environment_newly_required: bool,
    /// Manifest text changed while an environment is required
    pub manifest_changed: bool,
    pub files_changed: bool,
    pub entry_file_synthesized: bool,
}

impl NodeChange {
    /// Diff `old` against the already-normalized `new`.
    pub fn between(old: &Node, new: &Node) -> Self {
        let framework_changed = old.framework != new.framework;
        let renamed = old.name != new.name;
        let requires_env = new.requires_environment();
        Self {
            framework_changed,
            renamed,
            project_path_changed: new.project_path.is_none()
                || old.project_path != new.project_path
                || renamed,
            environment_newly_required: requires_env && !old.requires_environment(),
            manifest_changed: requires_env && old.environment_manifest != new.environment_manifest,
            files_changed: old.files != new.files,
            entry_file_synthesized: false,
        }
    }

    pub fn needs_directory_provisioning(&self) -> bool {
        self.project_path_changed
    }

    pub fn needs_environment(&self) -> bool {
        self.environment_newly_required
    }

    /// A manifest edit on a node that already had an environment.
    pub fn needs_requirements_update(&self) -> bool {
        self.manifest_changed && !self.environment_newly_required
    }

    pub fn needs_flush(&self) -> bool {
        self.files_changed
            || self.framework_changed
            || self.project_path_changed
            || self.manifest_changed
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Owned graph of nodes and their connections.
#[derive(Debug, Clone)]
pub struct NodeGraphStore {
    name: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    canvas: CanvasState,
    nodes: Vec<Node>,
    selected: Option<NodeId>,
}

impl NodeGraphStore {
    /// Create an empty graph for the named workspace.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created_at: now,
            modified_at: now,
            canvas: CanvasState::default(),
            nodes: Vec::new(),
            selected: None,
        }
    }

    /// Build a graph from loaded workspace metadata.
    ///
    /// Nodes are normalized and edges pointing at unknown nodes are dropped.
    pub fn from_workspace(workspace: Workspace) -> Result<Self> {
        let mut store = Self {
            name: workspace.name,
            created_at: workspace.created_at,
            modified_at: workspace.modified_at,
            canvas: workspace.canvas,
            nodes: Vec::with_capacity(workspace.nodes.len()),
            selected: None,
        };

        for node in workspace.nodes {
            store.insert_checked(node)?;
        }

        let known: HashSet<NodeId> = store.nodes.iter().map(|n| n.id).collect();
        for node in &mut store.nodes {
            let before = node.connections.len();
            node.connections.retain(|target| known.contains(target));
            if node.connections.len() != before {
                warn!(
                    node = %node.id,
                    dropped = before - node.connections.len(),
                    "Dropped connections to unknown nodes"
                );
            }
        }

        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn canvas(&self) -> CanvasState {
        self.canvas
    }

    pub fn set_canvas(&mut self, canvas: CanvasState) {
        self.canvas = canvas;
        self.touch();
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn selected(&self) -> Option<NodeId> {
        self.selected
    }

    /// Add a node, synthesizing its entry file if it has none.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = self.insert_checked(node)?;
        self.touch();
        debug!(node = %id, "Added node");
        Ok(id)
    }

    /// Remove a node and every edge that references it, in both directions.
    ///
    /// The node's project directory on disk is left alone.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let index = self.index_of(id)?;
        let removed = self.nodes.remove(index);

        for node in &mut self.nodes {
            node.connections.retain(|target| *target != id);
        }
        if self.selected == Some(id) {
            self.selected = None;
        }

        self.touch();
        debug!(node = %id, "Removed node");
        Ok(removed)
    }

    /// Replace a node wholesale and report what changed.
    pub fn update_node(&mut self, mut replacement: Node) -> Result<NodeChange> {
        let index = self.index_of(replacement.id)?;
        self.check_name_free(&replacement.name, Some(replacement.id))?;

        let old = &self.nodes[index];
        if old.name != replacement.name {
            // The derived project path follows the name.
            replacement.project_path = None;
        }

        let had_entry = replacement.entry_file().is_some();
        replacement.normalize();
        if !replacement.requires_environment() {
            replacement.environment_path = None;
        }
        let known: HashSet<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        replacement.connections.retain(|target| known.contains(target));

        let mut change = NodeChange::between(old, &replacement);
        change.entry_file_synthesized = !had_entry;

        self.nodes[index] = replacement;
        if !change.is_empty() {
            self.touch();
        }
        Ok(change)
    }

    /// Add the edge `from -> to`. Returns `false` if it already existed.
    pub fn add_connection(&mut self, from: NodeId, to: NodeId) -> Result<bool> {
        if self.node(to).is_none() {
            return Err(TrellisError::not_found("Node", to.to_string()));
        }
        let index = self.index_of(from)?;
        let source = &mut self.nodes[index];
        if source.is_connected_to(to) {
            return Ok(false);
        }
        source.connections.push(to);
        self.touch();
        Ok(true)
    }

    /// Remove the edge `from -> to`. Returns `false` if there was none.
    pub fn remove_connection(&mut self, from: NodeId, to: NodeId) -> bool {
        let Some(source) = self.nodes.iter_mut().find(|n| n.id == from) else {
            return false;
        };
        let before = source.connections.len();
        source.connections.retain(|target| *target != to);
        let removed = source.connections.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Select a node, or clear the selection with `None`.
    pub fn select_node(&mut self, id: Option<NodeId>) -> Result<()> {
        if let Some(id) = id {
            self.index_of(id)?;
        }
        self.selected = id;
        Ok(())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.nodes
            .iter()
            .flat_map(|n| n.connections.iter().map(move |to| Connection { from: n.id, to: *to }))
            .collect()
    }

    /// Record a worker-resolved project directory. Returns `false` if the node is gone.
    pub fn set_project_path(&mut self, id: NodeId, path: PathBuf) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.project_path = Some(path);
                true
            }
            None => false,
        }
    }

    /// Record a worker-resolved environment directory. Returns `false` if the node is gone.
    pub fn set_environment_path(&mut self, id: NodeId, path: Option<PathBuf>) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.environment_path = path;
                true
            }
            None => false,
        }
    }

    /// Copy of the whole workspace, suitable for handing to workers.
    pub fn snapshot(&self) -> Workspace {
        Workspace {
            name: self.name.clone(),
            version: SCHEMA_VERSION.to_string(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            canvas: self.canvas,
            nodes: self.nodes.clone(),
        }
    }

    fn insert_checked(&mut self, mut node: Node) -> Result<NodeId> {
        if self.node(node.id).is_some() {
            return Err(TrellisError::invalid_input(format!(
                "Node {} already exists",
                node.id
            )));
        }
        self.check_name_free(&node.name, None)?;
        node.normalize();
        let id = node.id;
        self.nodes.push(node);
        Ok(id)
    }

    /// Two nodes whose names sanitize to the same directory would share a project tree.
    fn check_name_free(&self, name: &str, except: Option<NodeId>) -> Result<()> {
        let key = collision_key(name);
        let clash = self
            .nodes
            .iter()
            .filter(|n| Some(n.id) != except)
            .find(|n| collision_key(&n.name) == key);
        match clash {
            Some(other) => Err(TrellisError::invalid_input(format!(
                "Node name '{}' collides with existing node '{}'",
                name, other.name
            ))),
            None => Ok(()),
        }
    }

    fn index_of(&self, id: NodeId) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| TrellisError::not_found("Node", id.to_string()))
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Framework;
    use crate::types::NodeKind;

    fn store_with(names: &[&str]) -> (NodeGraphStore, Vec<NodeId>) {
        let mut store = NodeGraphStore::new("test");
        let ids = names
            .iter()
            .map(|name| {
                store
                    .add_node(Node::new(*name, NodeKind::Service, Framework::Rust))
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn test_add_connection_is_idempotent() {
        let (mut store, ids) = store_with(&["a", "b"]);
        assert!(store.add_connection(ids[0], ids[1]).unwrap());
        assert!(!store.add_connection(ids[0], ids[1]).unwrap());
        assert_eq!(store.connections().len(), 1);
    }

    #[test]
    fn test_remove_missing_connection_is_noop() {
        let (mut store, ids) = store_with(&["a", "b"]);
        let before = store.snapshot();
        assert!(!store.remove_connection(ids[0], ids[1]));
        assert!(!store.remove_connection(NodeId::new(), ids[1]));
        assert_eq!(store.snapshot().nodes, before.nodes);
    }

    #[test]
    fn test_connection_requires_both_endpoints() {
        let (mut store, ids) = store_with(&["a"]);
        assert!(store.add_connection(ids[0], NodeId::new()).unwrap_err().is_not_found());
        assert!(store.add_connection(NodeId::new(), ids[0]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_node_cascades_edges() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        store.add_connection(a, b).unwrap();
        store.add_connection(b, c).unwrap();
        store.add_connection(c, b).unwrap();
        store.add_connection(a, c).unwrap();
        store.select_node(Some(b)).unwrap();

        let removed = store.remove_node(b).unwrap();
        assert_eq!(removed.id, b);
        assert_eq!(store.connections(), vec![Connection { from: a, to: c }]);
        assert_eq!(store.selected(), None);
    }

    #[test]
    fn test_name_collision_rejected() {
        let (mut store, ids) = store_with(&["api"]);
        let err = store
            .add_node(Node::new("API", NodeKind::Backend, Framework::Go))
            .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidInput(_)));

        // Renaming a node to its own name is fine.
        let node = store.node(ids[0]).unwrap().clone();
        assert!(store.update_node(node).is_ok());
    }

    #[test]
    fn test_update_framework_keeps_other_files() {
        let (mut store, ids) = store_with(&["svc"]);
        let mut node = store.node(ids[0]).unwrap().clone();
        node.project_path = Some(PathBuf::from("/tmp/svc"));
        store.update_node(node.clone()).unwrap();

        node.upsert_file("README.md", "docs");
        node.framework = Framework::Flask;
        let change = store.update_node(node).unwrap();

        assert!(change.framework_changed);
        assert!(change.entry_file_synthesized);
        assert!(change.environment_newly_required);
        assert!(!change.needs_requirements_update());
        assert!(!change.project_path_changed);

        let node = store.node(ids[0]).unwrap();
        assert!(node.file_by_path("src/main.rs").is_some());
        assert!(node.file_by_path("README.md").is_some());
        assert_eq!(node.entry_file().unwrap().path, "app.py");
    }

    #[test]
    fn test_switch_away_from_environment_clears_path() {
        let mut store = NodeGraphStore::new("test");
        let id = store
            .add_node(Node::new("py", NodeKind::Backend, Framework::Flask))
            .unwrap();
        store.set_environment_path(id, Some(PathBuf::from("/tmp/py/venv")));

        let mut node = store.node(id).unwrap().clone();
        node.environment_manifest = "flask\nrequests\n".to_string();
        store.update_node(node).unwrap();
        assert!(store.node(id).unwrap().environment_path.is_some());

        let mut node = store.node(id).unwrap().clone();
        node.framework = Framework::Go;
        store.update_node(node).unwrap();
        assert!(store.node(id).unwrap().environment_path.is_none());
    }

    #[test]
    fn test_manifest_change_triggers_requirements_update() {
        let mut store = NodeGraphStore::new("test");
        let mut node = Node::new("py", NodeKind::Backend, Framework::Python);
        node.project_path = Some(PathBuf::from("/tmp/py"));
        let id = store.add_node(node).unwrap();

        let mut node = store.node(id).unwrap().clone();
        node.environment_manifest = "requests\n".to_string();
        let change = store.update_node(node).unwrap();

        assert!(change.needs_requirements_update());
        assert!(!change.needs_environment());
        assert!(!change.needs_directory_provisioning());
        assert!(change.needs_flush());
    }

    #[test]
    fn test_rename_invalidates_project_path() {
        let (mut store, ids) = store_with(&["old"]);
        store.set_project_path(ids[0], PathBuf::from("/tmp/old"));

        let mut node = store.node(ids[0]).unwrap().clone();
        node.name = "new".to_string();
        let change = store.update_node(node).unwrap();

        assert!(change.renamed);
        assert!(change.needs_directory_provisioning());
        assert!(store.node(ids[0]).unwrap().project_path.is_none());
    }

    #[test]
    fn test_unchanged_update_is_empty() {
        let (mut store, ids) = store_with(&["same"]);
        store.set_project_path(ids[0], PathBuf::from("/tmp/same"));
        let node = store.node(ids[0]).unwrap().clone();
        let change = store.update_node(node).unwrap();
        assert!(change.is_empty());
    }

    #[test]
    fn test_from_workspace_drops_dangling_edges() {
        let mut ws = Workspace::new("loaded");
        let mut a = Node::new("a", NodeKind::Service, Framework::Go);
        let b = Node::new("b", NodeKind::Service, Framework::Go);
        a.connections = vec![b.id, NodeId::new()];
        let (a_id, b_id) = (a.id, b.id);
        ws.nodes = vec![a, b];

        let store = NodeGraphStore::from_workspace(ws).unwrap();
        assert_eq!(store.connections(), vec![Connection { from: a_id, to: b_id }]);
    }

    #[test]
    fn test_select_unknown_node_fails() {
        let (mut store, _) = store_with(&["a"]);
        assert!(store.select_node(Some(NodeId::new())).is_err());
        assert!(store.select_node(None).is_ok());
    }
}
