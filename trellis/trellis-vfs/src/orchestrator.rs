//! Synchronization orchestrator.
//!
//! One owner task holds the [`NodeGraphStore`]. Everything else talks to it
//! through a cloneable [`SyncOrchestrator`] handle: requests go over an
//! `mpsc` channel and answers come back on `oneshot` channels.
//!
//! Disk work never happens on the owner. When a node is added, changed or
//! loaded the owner spawns a worker that checks out the node's current state,
//! creates its project directory, flushes its files and, when the framework
//! needs one, provisions its environment. Workers report back as messages and
//! the owner applies the results.
//!
//! Writes to one node's directory are serialized by [`NodeLocks`]; different
//! nodes proceed concurrently.

use crate::archive::{ArchiveCodec, ArchiveReport};
use crate::environment::{provisioner_from_config, EnvironmentProvisioner, NoopProvisioner};
use crate::path::RelativePath;
use crate::project::ProjectDirectoryService;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use trellis_core::config::{SyncConfig, TrellisConfig, MAX_WORKERS_LIMIT};
use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{NodeChange, NodeGraphStore};
use trellis_core::id::NodeId;
use trellis_core::types::{CanvasState, Node, NodeSyncState, ProjectFile, Workspace};

/// Services the orchestrator dispatches work to.
pub struct SyncServices {
    pub directories: ProjectDirectoryService,
    pub codec: ArchiveCodec,
    pub provisioner: Arc<dyn EnvironmentProvisioner>,
    /// Upper bound on concurrent flush and restore tasks during save/load
    pub max_workers: usize,
    pub provision_environments: bool,
}

impl SyncServices {
    /// Services rooted at `projects_root` with default settings and no
    /// environment provisioning.
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        let sync = SyncConfig::default();
        Self {
            directories: ProjectDirectoryService::new(projects_root),
            codec: ArchiveCodec::default(),
            provisioner: Arc::new(NoopProvisioner),
            max_workers: sync.max_workers.clamp(1, MAX_WORKERS_LIMIT),
            provision_environments: sync.provision_environments,
        }
    }

    pub fn from_config(config: &TrellisConfig) -> Result<Self> {
        Ok(Self {
            directories: ProjectDirectoryService::new(&config.workspace.projects_dir),
            codec: ArchiveCodec::from_config(&config.archive),
            provisioner: provisioner_from_config(&config.environment)?,
            max_workers: config.sync.max_workers.clamp(1, MAX_WORKERS_LIMIT),
            provision_environments: config.sync.provision_environments,
        })
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn EnvironmentProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.clamp(1, MAX_WORKERS_LIMIT);
        self
    }

    fn worker_permits(&self) -> usize {
        self.max_workers.clamp(1, MAX_WORKERS_LIMIT)
    }
}

/// Per-node write locks.
///
/// `tokio::sync::Mutex` queues waiters in order, so a request that arrives
/// while a flush is running waits for it instead of racing it.
#[derive(Debug, Clone, Default)]
pub struct NodeLocks {
    inner: Arc<DashMap<NodeId, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: NodeId) -> OwnedMutexGuard<()> {
        let mutex = self.inner.entry(id).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Drop the lock entry of a removed node. Holders keep their guard.
    pub fn forget(&self, id: NodeId) {
        self.inner.remove(&id);
    }
}

/// Counts outstanding background work.
#[derive(Debug, Clone)]
struct WorkTracker {
    outstanding: Arc<watch::Sender<usize>>,
}

impl WorkTracker {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            outstanding: Arc::new(tx),
        }
    }

    fn begin(&self) -> WorkGuard {
        self.outstanding.send_modify(|n| *n += 1);
        WorkGuard {
            tracker: self.clone(),
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

struct WorkGuard {
    tracker: WorkTracker,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.tracker
            .outstanding
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Result of [`SyncOrchestrator::save`].
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    pub nodes_flushed: usize,
    pub files_written: usize,
    pub files_unchanged: usize,
    pub archive: ArchiveReport,
    pub duration_ms: u64,
}

/// How [`SyncOrchestrator::load_with`] treats project directories that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePolicy {
    /// Copy every archived tree over its project directory.
    #[default]
    Overwrite,
    /// Restore only missing project directories. Existing ones stay as they
    /// are and their tracked file contents are read back into the graph.
    KeepExisting,
}

/// Result of [`SyncOrchestrator::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub workspace_name: String,
    pub nodes: usize,
    pub connections: usize,
    pub files_restored: usize,
    /// Nodes whose files were read back from an existing directory
    pub nodes_reloaded: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct SyncJob {
    generation: u64,
    ensure_environment: bool,
    update_requirements: bool,
}

#[derive(Debug, Clone, Copy)]
struct Tracking {
    generation: u64,
    state: NodeSyncState,
}

enum OwnerCommand {
    AddNode {
        node: Node,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    UpdateNode {
        node: Node,
        reply: oneshot::Sender<Result<NodeChange>>,
    },
    RemoveNode {
        id: NodeId,
        reply: oneshot::Sender<Result<Node>>,
    },
    AddConnection {
        from: NodeId,
        to: NodeId,
        reply: oneshot::Sender<Result<bool>>,
    },
    RemoveConnection {
        from: NodeId,
        to: NodeId,
        reply: oneshot::Sender<bool>,
    },
    SelectNode {
        id: Option<NodeId>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCanvas {
        canvas: CanvasState,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Workspace>,
    },
    Checkout {
        id: NodeId,
        reply: oneshot::Sender<Option<(Node, String)>>,
    },
    NodeState {
        id: NodeId,
        reply: oneshot::Sender<Option<NodeSyncState>>,
    },
    ReplaceStore {
        store: NodeGraphStore,
        reply: oneshot::Sender<()>,
    },
    DirectoryReady {
        id: NodeId,
        generation: u64,
        path: PathBuf,
    },
    Flushed {
        id: NodeId,
        generation: u64,
        awaiting_environment: bool,
    },
    EnvironmentDone {
        id: NodeId,
        generation: u64,
        environment_path: Option<PathBuf>,
    },
    SyncFailed {
        id: NodeId,
        generation: u64,
    },
    Shutdown,
}

/// Cloneable handle to the owner task.
#[derive(Clone)]
pub struct SyncOrchestrator {
    commands: mpsc::UnboundedSender<OwnerCommand>,
    services: Arc<SyncServices>,
    locks: NodeLocks,
    tracker: WorkTracker,
    archive_gate: Arc<Mutex<()>>,
}

impl SyncOrchestrator {
    /// Start the owner task for `store`.
    ///
    /// The join handle yields the final store once the owner stops, either
    /// through [`shutdown`](Self::shutdown) or when every handle is dropped.
    pub fn spawn(store: NodeGraphStore, services: SyncServices) -> (Self, JoinHandle<NodeGraphStore>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let services = Arc::new(services);
        let locks = NodeLocks::new();
        let tracker = WorkTracker::new();

        let mut owner = Owner {
            store,
            tracking: HashMap::new(),
            generation: 0,
            services: services.clone(),
            locks: locks.clone(),
            tracker: tracker.clone(),
            reports: commands.downgrade(),
        };
        let existing: Vec<(NodeId, bool)> = owner
            .store
            .nodes()
            .iter()
            .map(|n| (n.id, n.requires_environment()))
            .collect();
        for (id, requires_environment) in existing {
            owner.dispatch(id, requires_environment, false);
        }

        let handle = tokio::spawn(owner.run(rx));
        (
            Self {
                commands,
                services,
                locks,
                tracker,
                archive_gate: Arc::new(Mutex::new(())),
            },
            handle,
        )
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> OwnerCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| TrellisError::concurrency("Owner task has stopped"))?;
        rx.await
            .map_err(|_| TrellisError::concurrency("Owner task dropped the request"))
    }

    /// Add a node and start provisioning its project directory.
    pub async fn add_node(&self, node: Node) -> Result<NodeId> {
        self.request(|reply| OwnerCommand::AddNode { node, reply }).await?
    }

    /// Replace a node; the returned change drives what gets re-synced.
    pub async fn update_node(&self, node: Node) -> Result<NodeChange> {
        self.request(|reply| OwnerCommand::UpdateNode { node, reply }).await?
    }

    /// Remove a node and its edges. The project directory stays on disk.
    pub async fn remove_node(&self, id: NodeId) -> Result<Node> {
        self.request(|reply| OwnerCommand::RemoveNode { id, reply }).await?
    }

    pub async fn add_connection(&self, from: NodeId, to: NodeId) -> Result<bool> {
        self.request(|reply| OwnerCommand::AddConnection { from, to, reply })
            .await?
    }

    pub async fn remove_connection(&self, from: NodeId, to: NodeId) -> Result<bool> {
        self.request(|reply| OwnerCommand::RemoveConnection { from, to, reply })
            .await
    }

    pub async fn select_node(&self, id: Option<NodeId>) -> Result<()> {
        self.request(|reply| OwnerCommand::SelectNode { id, reply }).await?
    }

    pub async fn set_canvas(&self, canvas: CanvasState) -> Result<()> {
        self.request(|reply| OwnerCommand::SetCanvas { canvas, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Workspace> {
        self.request(|reply| OwnerCommand::Snapshot { reply }).await
    }

    pub async fn node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self
            .request(|reply| OwnerCommand::Checkout { id, reply })
            .await?
            .map(|(node, _)| node))
    }

    /// Sync state of a node, `None` if it is not in the graph.
    pub async fn node_state(&self, id: NodeId) -> Result<Option<NodeSyncState>> {
        self.request(|reply| OwnerCommand::NodeState { id, reply }).await
    }

    /// Resolves once no directory, flush or environment work is outstanding.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await;
    }

    /// Stop the owner task. Workers already running finish on their own.
    pub fn shutdown(&self) {
        let _ = self.commands.send(OwnerCommand::Shutdown);
    }

    async fn checkout(&self, id: NodeId) -> Result<(Node, String)> {
        self.request(|reply| OwnerCommand::Checkout { id, reply })
            .await?
            .ok_or_else(|| TrellisError::not_found("Node", id.to_string()))
    }

    fn resolved_path(&self, node: &Node, workspace_name: &str) -> PathBuf {
        node.project_path
            .clone()
            .unwrap_or_else(|| self.services.directories.project_path(node, workspace_name))
    }

    /// Reveal a node's project directory in the platform file browser.
    pub async fn open_in_file_browser(&self, id: NodeId) -> Result<bool> {
        let (node, workspace_name) = self.checkout(id).await?;
        Ok(self
            .services
            .directories
            .open_in_file_browser(&node, &workspace_name)
            .await)
    }

    /// Pull tracked file contents from disk into the graph.
    pub async fn reload_from_disk(&self, id: NodeId) -> Result<NodeChange> {
        let (mut node, workspace_name) = self.checkout(id).await?;
        let path = self.resolved_path(&node, &workspace_name);
        let files = {
            let _held = self.locks.lock(id).await;
            self.services.directories.read_back_files(&node, &path).await?
        };
        node.files = files;
        self.update_node(node).await
    }

    /// Files in a node's project directory that the node does not track.
    pub async fn untracked_files(&self, id: NodeId) -> Result<Vec<RelativePath>> {
        let (node, workspace_name) = self.checkout(id).await?;
        let path = self.resolved_path(&node, &workspace_name);
        self.services.directories.scan_untracked(&node, &path).await
    }

    /// Flush every node and write the workspace archive to `dest`.
    ///
    /// Each node is re-read from the owner once its lock is held, and the
    /// locks stay held until the archive is written, so the archived trees
    /// match the archived metadata. If any node fails to flush no archive is
    /// written and `dest` is left as it was.
    pub async fn save(&self, dest: &Path) -> Result<SaveReport> {
        let _gate = self.archive_gate.lock().await;
        let start = Instant::now();
        let mut workspace = self.snapshot().await?;
        info!(
            nodes = workspace.nodes.len(),
            "Saving workspace '{}' to {}",
            workspace.name,
            dest.display()
        );

        let mut report = SaveReport::default();
        let (mut flushed, _held) = match self.flush_all(&workspace, &mut report).await {
            Ok(flushed) => flushed,
            Err(e) => {
                error!("Save aborted, no archive written: {}", e);
                return Err(e);
            }
        };

        // Nodes removed since the snapshot are left out, along with edges to them.
        workspace.nodes = workspace
            .nodes
            .iter()
            .filter_map(|n| flushed.remove(&n.id))
            .collect();
        let kept: HashSet<NodeId> = workspace.nodes.iter().map(|n| n.id).collect();
        for node in &mut workspace.nodes {
            node.connections.retain(|target| kept.contains(target));
        }

        report.archive = self.services.codec.save(&workspace, dest).await.inspect_err(|e| {
            error!("Failed to write archive {}: {}", dest.display(), e);
        })?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Flush every node under its lock and hand back the flushed nodes
    /// together with the guards.
    async fn flush_all(
        &self,
        workspace: &Workspace,
        report: &mut SaveReport,
    ) -> Result<(HashMap<NodeId, Node>, Vec<OwnedMutexGuard<()>>)> {
        let mut tasks = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.services.worker_permits()));

        for id in workspace.nodes.iter().map(|n| n.id) {
            let this = self.clone();
            let workspace_name = workspace.name.clone();
            let sem = semaphore.clone();

            tasks.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| TrellisError::concurrency(format!("Flush semaphore closed: {}", e)))?;
                let held = this.locks.lock(id).await;
                let Some(mut node) = this.node(id).await? else {
                    debug!(node = %id, "Node removed before save flushed it");
                    return Ok(None);
                };
                let directories = &this.services.directories;
                let path = directories
                    .create_project_structure(&node, &workspace_name)
                    .await?;
                let flushed = directories.save_all_files(&node, &path).await?;
                node.project_path = Some(path);
                Ok::<_, TrellisError>(Some((node, flushed, held)))
            });
        }

        let mut nodes = HashMap::new();
        let mut guards = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some((node, flushed, held)))) => {
                    report.nodes_flushed += 1;
                    report.files_written += flushed.files_written;
                    report.files_unchanged += flushed.files_unchanged;
                    nodes.insert(node.id, node);
                    guards.push(held);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!("Node flush failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!("Flush task failed: {}", e);
                    first_error.get_or_insert(TrellisError::concurrency(format!("Flush task failed: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((nodes, guards)),
        }
    }

    /// Replace the current workspace with the one archived at `src`,
    /// overwriting project directories with the archived trees.
    pub async fn load(&self, src: &Path) -> Result<LoadReport> {
        self.load_with(src, RestorePolicy::Overwrite).await
    }

    /// Replace the current workspace with the one archived at `src`.
    ///
    /// The current graph is kept until the archive has been extracted, parsed
    /// and every node tree restored. Afterwards each node is re-provisioned in
    /// the background.
    pub async fn load_with(&self, src: &Path, policy: RestorePolicy) -> Result<LoadReport> {
        let _gate = self.archive_gate.lock().await;
        let start = Instant::now();
        info!(?policy, "Loading workspace from {}", src.display());

        let extracted = Arc::new(self.services.codec.extract(src).await.inspect_err(|e| {
            error!("Failed to open {}: {}", src.display(), e);
        })?);
        let mut workspace = extracted.workspace().clone();
        // Validates ids and names before anything touches the disk.
        NodeGraphStore::from_workspace(workspace.clone())
            .map_err(|e| TrellisError::invalid_archive(format!("{}: {}", src.display(), e)))?;

        let mut tasks = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.services.worker_permits()));
        for node in workspace.nodes.iter().cloned() {
            let services = self.services.clone();
            let locks = self.locks.clone();
            let extracted = extracted.clone();
            let workspace_name = workspace.name.clone();
            let sem = semaphore.clone();

            tasks.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| TrellisError::concurrency(format!("Restore semaphore closed: {}", e)))?;
                let _held = locks.lock(node.id).await;
                let path = services.directories.project_path(&node, &workspace_name);
                if policy == RestorePolicy::KeepExisting && path.is_dir() {
                    let files = services.directories.read_back_files(&node, &path).await?;
                    return Ok::<_, TrellisError>((node.id, 0, Some(files)));
                }
                let copied = extracted.restore_node(node.id, &path).await?;
                Ok((node.id, copied, None))
            });
        }

        let mut files_restored = 0;
        let mut reloaded: HashMap<NodeId, Vec<ProjectFile>> = HashMap::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((id, copied, files))) => {
                    files_restored += copied;
                    if let Some(files) = files {
                        reloaded.insert(id, files);
                    }
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(TrellisError::concurrency(format!("Restore task failed: {}", e)));
                }
            }
        }
        if let Some(e) = first_error {
            error!("Load aborted, workspace unchanged: {}", e);
            return Err(e);
        }

        let nodes_reloaded = reloaded.len();
        for node in &mut workspace.nodes {
            if let Some(files) = reloaded.remove(&node.id) {
                node.files = files;
            }
        }
        let store = NodeGraphStore::from_workspace(workspace)
            .map_err(|e| TrellisError::invalid_archive(format!("{}: {}", src.display(), e)))?;

        let report = LoadReport {
            workspace_name: store.name().to_string(),
            nodes: store.len(),
            connections: store.connections().len(),
            files_restored,
            nodes_reloaded,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.request(|reply| OwnerCommand::ReplaceStore { store, reply })
            .await?;

        info!(
            nodes = report.nodes,
            files = report.files_restored,
            reloaded = report.nodes_reloaded,
            "Loaded workspace '{}'",
            report.workspace_name
        );
        Ok(report)
    }
}

/// State private to the owner task.
struct Owner {
    store: NodeGraphStore,
    tracking: HashMap<NodeId, Tracking>,
    generation: u64,
    services: Arc<SyncServices>,
    locks: NodeLocks,
    tracker: WorkTracker,
    reports: mpsc::WeakUnboundedSender<OwnerCommand>,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OwnerCommand>) -> NodeGraphStore {
        debug!("Owner task started for workspace '{}'", self.store.name());
        while let Some(command) = rx.recv().await {
            if matches!(command, OwnerCommand::Shutdown) {
                break;
            }
            self.handle(command);
        }
        debug!("Owner task stopped");
        self.store
    }

    fn handle(&mut self, command: OwnerCommand) {
        match command {
            OwnerCommand::AddNode { node, reply } => {
                let requires_environment = node.requires_environment();
                let result = self.store.add_node(node);
                if let Ok(id) = &result {
                    self.dispatch(*id, requires_environment, false);
                }
                let _ = reply.send(result);
            }
            OwnerCommand::UpdateNode { node, reply } => {
                let id = node.id;
                let result = self.store.update_node(node);
                if let Ok(change) = &result {
                    if change.needs_flush() || change.needs_directory_provisioning() {
                        self.dispatch(id, change.needs_environment(), change.needs_requirements_update());
                    }
                }
                let _ = reply.send(result);
            }
            OwnerCommand::RemoveNode { id, reply } => {
                let result = self.store.remove_node(id);
                if result.is_ok() {
                    self.tracking.remove(&id);
                    self.locks.forget(id);
                }
                let _ = reply.send(result);
            }
            OwnerCommand::AddConnection { from, to, reply } => {
                let _ = reply.send(self.store.add_connection(from, to));
            }
            OwnerCommand::RemoveConnection { from, to, reply } => {
                let _ = reply.send(self.store.remove_connection(from, to));
            }
            OwnerCommand::SelectNode { id, reply } => {
                let _ = reply.send(self.store.select_node(id));
            }
            OwnerCommand::SetCanvas { canvas, reply } => {
                self.store.set_canvas(canvas);
                let _ = reply.send(());
            }
            OwnerCommand::Snapshot { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
            OwnerCommand::Checkout { id, reply } => {
                let checkout = self
                    .store
                    .node(id)
                    .cloned()
                    .map(|node| (node, self.store.name().to_string()));
                let _ = reply.send(checkout);
            }
            OwnerCommand::NodeState { id, reply } => {
                let state = self
                    .store
                    .node(id)
                    .map(|_| self.tracking.get(&id).map_or(NodeSyncState::Unsynced, |t| t.state));
                let _ = reply.send(state);
            }
            OwnerCommand::ReplaceStore { store, reply } => {
                info!(nodes = store.len(), "Replacing workspace '{}'", self.store.name());
                self.store = store;
                self.tracking.clear();
                let nodes: Vec<(NodeId, bool)> = self
                    .store
                    .nodes()
                    .iter()
                    .map(|n| (n.id, n.requires_environment()))
                    .collect();
                for (id, requires_environment) in nodes {
                    self.dispatch(id, requires_environment, false);
                }
                let _ = reply.send(());
            }
            OwnerCommand::DirectoryReady { id, generation, path } => {
                if self.advance(id, generation, NodeSyncState::DirectoryProvisioned) {
                    self.store.set_project_path(id, path);
                }
            }
            OwnerCommand::Flushed {
                id,
                generation,
                awaiting_environment,
            } => {
                let state = if awaiting_environment {
                    NodeSyncState::AwaitingEnvironment
                } else {
                    NodeSyncState::Synced
                };
                self.advance(id, generation, state);
            }
            OwnerCommand::EnvironmentDone {
                id,
                generation,
                environment_path,
            } => {
                if self.advance(id, generation, NodeSyncState::Synced) && environment_path.is_some() {
                    self.store.set_environment_path(id, environment_path);
                }
            }
            OwnerCommand::SyncFailed { id, generation } => {
                self.advance(id, generation, NodeSyncState::Failed);
            }
            OwnerCommand::Shutdown => {}
        }
    }

    /// Record a worker's progress unless a newer job has been dispatched since.
    fn advance(&mut self, id: NodeId, generation: u64, state: NodeSyncState) -> bool {
        match self.tracking.get_mut(&id) {
            Some(tracking) if tracking.generation == generation => {
                tracking.state = state;
                true
            }
            _ => false,
        }
    }

    fn dispatch(&mut self, id: NodeId, ensure_environment: bool, update_requirements: bool) {
        let Some(reports) = self.reports.upgrade() else {
            return;
        };
        self.generation += 1;
        let job = SyncJob {
            generation: self.generation,
            ensure_environment,
            update_requirements,
        };
        self.tracking.insert(
            id,
            Tracking {
                generation: job.generation,
                state: NodeSyncState::Unsynced,
            },
        );

        let worker = Worker {
            services: self.services.clone(),
            locks: self.locks.clone(),
            reports,
        };
        let guard = self.tracker.begin();
        debug!(node = %id, generation = job.generation, "Dispatching sync job");
        tokio::spawn(async move {
            worker.sync_node(id, job).await;
            drop(guard);
        });
    }
}

/// Everything a sync worker needs, detached from the owner.
struct Worker {
    services: Arc<SyncServices>,
    locks: NodeLocks,
    reports: mpsc::UnboundedSender<OwnerCommand>,
}

impl Worker {
    fn report(&self, command: OwnerCommand) {
        let _ = self.reports.send(command);
    }

    async fn checkout(&self, id: NodeId) -> Option<(Node, String)> {
        let (reply, rx) = oneshot::channel();
        self.reports.send(OwnerCommand::Checkout { id, reply }).ok()?;
        rx.await.ok().flatten()
    }

    async fn sync_node(&self, id: NodeId, job: SyncJob) {
        let held = self.locks.lock(id).await;

        // The node may have changed or vanished while this job was queued.
        let Some((mut node, workspace_name)) = self.checkout(id).await else {
            debug!(node = %id, "Node gone before sync started");
            return;
        };
        let generation = job.generation;

        let directories = &self.services.directories;
        let path = match directories.create_project_structure(&node, &workspace_name).await {
            Ok(path) => path,
            Err(e) => {
                error!(node = %id, "Directory provisioning failed: {}", e);
                self.report(OwnerCommand::SyncFailed { id, generation });
                return;
            }
        };
        self.report(OwnerCommand::DirectoryReady {
            id,
            generation,
            path: path.clone(),
        });
        node.project_path = Some(path.clone());

        let provision = self.services.provision_environments
            && node.requires_environment()
            && (job.ensure_environment || job.update_requirements);

        if let Err(e) = directories.save_all_files(&node, &path).await {
            error!(node = %id, "Flush failed: {}", e);
            self.report(OwnerCommand::SyncFailed { id, generation });
            return;
        }
        self.report(OwnerCommand::Flushed {
            id,
            generation,
            awaiting_environment: provision,
        });
        drop(held);

        if !provision {
            return;
        }

        let provisioner = &self.services.provisioner;
        let outcome = if job.ensure_environment {
            info!(node = %id, provisioner = provisioner.name(), "Provisioning environment");
            provisioner.ensure_environment(&node, &path).await
        } else {
            info!(node = %id, provisioner = provisioner.name(), "Updating requirements");
            provisioner.update_requirements(&node, &path).await
        };
        let environment_path = match outcome {
            Ok(outcome) if outcome.success => outcome.environment_path,
            Ok(outcome) => {
                warn!(node = %id, "Environment provisioning failed: {}", outcome.diagnostic);
                None
            }
            Err(e) => {
                warn!(node = %id, "Environment provisioning failed: {}", e);
                None
            }
        };
        self.report(OwnerCommand::EnvironmentDone {
            id,
            generation,
            environment_path,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_core::framework::Framework;
    use trellis_core::types::NodeKind;

    #[tokio::test]
    async fn test_add_node_provisions_directory() {
        let temp = TempDir::new().unwrap();
        let (orchestrator, _owner) =
            SyncOrchestrator::spawn(NodeGraphStore::new("ws"), SyncServices::new(temp.path()));

        let id = orchestrator
            .add_node(Node::new("api", NodeKind::Backend, Framework::Go))
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        let node = orchestrator.node(id).await.unwrap().unwrap();
        let path = node.project_path.unwrap();
        assert_eq!(path, temp.path().join("ws").join("api"));
        assert!(path.join("main.go").is_file());
        assert_eq!(
            orchestrator.node_state(id).await.unwrap(),
            Some(NodeSyncState::Synced)
        );
    }

    #[tokio::test]
    async fn test_later_update_wins_on_disk() {
        let temp = TempDir::new().unwrap();
        let (orchestrator, _owner) =
            SyncOrchestrator::spawn(NodeGraphStore::new("ws"), SyncServices::new(temp.path()));

        let id = orchestrator
            .add_node(Node::new("svc", NodeKind::Service, Framework::Go))
            .await
            .unwrap();
        for i in 0..5 {
            let mut node = orchestrator.node(id).await.unwrap().unwrap();
            node.upsert_file("main.go", format!("package main // {}", i));
            orchestrator.update_node(node).await.unwrap();
        }
        orchestrator.wait_idle().await;

        let content = std::fs::read_to_string(temp.path().join("ws/svc/main.go")).unwrap();
        assert_eq!(content, "package main // 4");
    }

    #[tokio::test]
    async fn test_failed_directory_marks_node_failed() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        let (orchestrator, _owner) =
            SyncOrchestrator::spawn(NodeGraphStore::new("ws"), SyncServices::new(&blocker));

        let id = orchestrator
            .add_node(Node::new("svc", NodeKind::Service, Framework::Go))
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        assert_eq!(
            orchestrator.node_state(id).await.unwrap(),
            Some(NodeSyncState::Failed)
        );
    }

    #[tokio::test]
    async fn test_shutdown_returns_store() {
        let temp = TempDir::new().unwrap();
        let (orchestrator, owner) =
            SyncOrchestrator::spawn(NodeGraphStore::new("ws"), SyncServices::new(temp.path()));
        orchestrator
            .add_node(Node::new("a", NodeKind::Custom, Framework::Custom))
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        orchestrator.shutdown();
        let store = owner.await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(orchestrator.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_worker_limit_is_clamped() {
        let temp = TempDir::new().unwrap();
        let services = SyncServices::new(temp.path().join("projects")).with_max_workers(usize::MAX);
        assert_eq!(services.max_workers, MAX_WORKERS_LIMIT);

        let mut config = TrellisConfig::default();
        config.workspace.projects_dir = temp.path().join("projects");
        config.sync.max_workers = usize::MAX;
        let services = SyncServices::from_config(&config).unwrap();
        assert_eq!(services.max_workers, MAX_WORKERS_LIMIT);

        let (orchestrator, _owner) = SyncOrchestrator::spawn(NodeGraphStore::new("ws"), services);
        orchestrator
            .add_node(Node::new("svc", NodeKind::Service, Framework::Go))
            .await
            .unwrap();
        orchestrator.wait_idle().await;
        let report = orchestrator.save(&temp.path().join("ws.trellis")).await.unwrap();
        assert_eq!(report.nodes_flushed, 1);
    }

    #[test]
    fn test_stale_environment_report_is_ignored() {
        let temp = TempDir::new().unwrap();
        let mut store = NodeGraphStore::new("ws");
        let id = store
            .add_node(Node::new("py", NodeKind::Backend, Framework::Python))
            .unwrap();
        let (reports, _rx) = mpsc::unbounded_channel();
        let mut owner = Owner {
            store,
            tracking: HashMap::new(),
            generation: 2,
            services: Arc::new(SyncServices::new(temp.path())),
            locks: NodeLocks::new(),
            tracker: WorkTracker::new(),
            reports: reports.downgrade(),
        };
        owner.tracking.insert(
            id,
            Tracking {
                generation: 2,
                state: NodeSyncState::AwaitingEnvironment,
            },
        );

        owner.handle(OwnerCommand::EnvironmentDone {
            id,
            generation: 1,
            environment_path: Some(temp.path().join("old/venv")),
        });
        assert!(owner.store.node(id).unwrap().environment_path.is_none());
        assert_eq!(owner.tracking[&id].state, NodeSyncState::AwaitingEnvironment);

        owner.handle(OwnerCommand::EnvironmentDone {
            id,
            generation: 2,
            environment_path: Some(temp.path().join("py/venv")),
        });
        assert_eq!(
            owner.store.node(id).unwrap().environment_path,
            Some(temp.path().join("py/venv"))
        );
        assert_eq!(owner.tracking[&id].state, NodeSyncState::Synced);
    }

    #[tokio::test]
    async fn test_node_state_unknown_node() {
        let temp = TempDir::new().unwrap();
        let (orchestrator, _owner) =
            SyncOrchestrator::spawn(NodeGraphStore::new("ws"), SyncServices::new(temp.path()));
        assert_eq!(orchestrator.node_state(NodeId::new()).await.unwrap(), None);
    }
}
