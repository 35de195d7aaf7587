//! Core data model: nodes, their project files, edges and the workspace
//! aggregate that is persisted as archive metadata.

use crate::framework::Framework;
use crate::id::{FileId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Archive metadata schema version.
pub const SCHEMA_VERSION: &str = "1.0";

/// Cosmetic category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    MobileApp,
    Service,
    Backend,
    Frontend,
    Custom,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MobileApp => "mobile_app",
            Self::Service => "service",
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = crate::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "mobile_app" | "mobile" => Ok(Self::MobileApp),
            "service" => Ok(Self::Service),
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "custom" => Ok(Self::Custom),
            _ => Err(crate::error::TrellisError::invalid_input(format!(
                "Invalid node kind '{}'. Must be one of: mobile_app, service, backend, frontend, custom",
                s
            ))),
        }
    }
}

/// A point on the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Language tag of a project file, used for presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Swift,
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Html,
    Css,
    Json,
    Markdown,
    Toml,
    Yaml,
    Shell,
    Text,
}

impl Language {
    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "swift" => Self::Swift,
            "py" | "pyi" => Self::Python,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "rs" => Self::Rust,
            "go" => Self::Go,
            "html" | "htm" => Self::Html,
            "css" | "scss" => Self::Css,
            "json" => Self::Json,
            "md" | "markdown" => Self::Markdown,
            "toml" => Self::Toml,
            "yaml" | "yml" => Self::Yaml,
            "sh" | "bash" | "zsh" => Self::Shell,
            _ => Self::Text,
        }
    }

    /// Detect language from a relative file path
    pub fn from_path(path: &str) -> Self {
        path.rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| Self::from_extension(ext))
            .unwrap_or(Self::Text)
    }
}

/// A text file tracked by a node, addressed by its project-relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub id: FileId,
    /// Path relative to the node's project root, `/`-separated
    pub path: String,
    pub name: String,
    pub content: String,
    pub language: Language,
}

impl ProjectFile {
    /// Create a file, deriving its display name and language from the path.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let language = Language::from_path(&path);
        Self {
            id: FileId::new(),
            path,
            name,
            content: content.into(),
            language,
        }
    }
}

/// One independent code project in the workspace graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub position: Position,
    pub framework: Framework,
    pub files: Vec<ProjectFile>,
    #[serde(default)]
    pub selected_file_id: Option<FileId>,
    /// Resolved project directory; runtime state, recomputed after load
    #[serde(skip)]
    pub project_path: Option<PathBuf>,
    #[serde(skip)]
    pub environment_path: Option<PathBuf>,
    #[serde(default)]
    pub environment_manifest: String,
    /// Outgoing edges, in insertion order
    #[serde(default)]
    pub connections: Vec<NodeId>,
}

impl Node {
    /// Create a node whose entry file is synthesized from the framework template.
    pub fn new(name: impl Into<String>, kind: NodeKind, framework: Framework) -> Self {
        let descriptor = framework.descriptor();
        Self {
            id: NodeId::new(),
            name: name.into(),
            kind,
            position: Position::default(),
            framework,
            files: vec![ProjectFile::new(descriptor.entry_path, descriptor.template)],
            selected_file_id: None,
            project_path: None,
            environment_path: None,
            environment_manifest: descriptor.default_manifest.to_string(),
            connections: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn requires_environment(&self) -> bool {
        self.framework.requires_environment()
    }

    pub fn file(&self, id: FileId) -> Option<&ProjectFile> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn file_by_path(&self, path: &str) -> Option<&ProjectFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// The file at the framework's entry path.
    pub fn entry_file(&self) -> Option<&ProjectFile> {
        self.file_by_path(self.framework.entry_path())
    }

    /// The selected file, falling back to the entry file, then the first file.
    pub fn selected_file(&self) -> Option<&ProjectFile> {
        self.selected_file_id
            .and_then(|id| self.file(id))
            .or_else(|| self.entry_file())
            .or_else(|| self.files.first())
    }

    /// Insert a file, or replace the content of the file already at that path.
    pub fn upsert_file(&mut self, path: &str, content: impl Into<String>) -> FileId {
        if let Some(existing) = self.files.iter_mut().find(|f| f.path == path) {
            existing.content = content.into();
            return existing.id;
        }
        let file = ProjectFile::new(path, content);
        let id = file.id;
        self.files.push(file);
        id
    }

    /// Make sure a file exists at the framework's entry path.
    ///
    /// Returns `true` when a new entry file was synthesized. Other files are
    /// left untouched.
    pub fn ensure_entry_file(&mut self) -> bool {
        let descriptor = self.framework.descriptor();
        if self.file_by_path(descriptor.entry_path).is_some() {
            return false;
        }
        self.files
            .insert(0, ProjectFile::new(descriptor.entry_path, descriptor.template));
        true
    }

    /// Re-establish the node invariants after an arbitrary replacement.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.files.retain(|f| seen.insert(f.path.clone()));

        self.ensure_entry_file();

        if let Some(selected) = self.selected_file_id {
            if self.file(selected).is_none() {
                self.selected_file_id = None;
            }
        }

        let mut seen = HashSet::new();
        self.connections.retain(|id| seen.insert(*id));
    }

    pub fn is_connected_to(&self, target: NodeId) -> bool {
        self.connections.contains(&target)
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: NodeId,
    pub to: NodeId,
}

/// Canvas view state; persisted but not interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    pub offset: Position,
    pub scale: f64,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            offset: Position::default(),
            scale: 1.0,
        }
    }
}

/// The full workspace: nodes, their edges and canvas view state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub canvas: CanvasState,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            version: SCHEMA_VERSION.to_string(),
            created_at: now,
            modified_at: now,
            canvas: CanvasState::default(),
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All edges, ordered by source node then insertion order.
    pub fn connections(&self) -> Vec<Connection> {
        self.nodes
            .iter()
            .flat_map(|n| n.connections.iter().map(move |to| Connection { from: n.id, to: *to }))
            .collect()
    }
}

/// Where a node is in its synchronization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSyncState {
    /// Work dispatched, nothing on disk confirmed yet
    Unsynced,
    DirectoryProvisioned,
    /// Files flushed; environment provisioning still running
    AwaitingEnvironment,
    /// Files flushed and, where required, environment provisioning attempted
    Synced,
    /// Directory creation or flush failed
    Failed,
}
