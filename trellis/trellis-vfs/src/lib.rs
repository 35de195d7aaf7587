//! On-disk side of Trellis.
//!
//! This crate keeps node project directories in step with the in-memory
//! graph and packs whole workspaces into single-file archives:
//! - `ProjectDirectoryService`: per-node directories and atomic file flushes
//! - `ArchiveCodec`: zip archives with metadata plus every node's code tree
//! - `EnvironmentProvisioner`: pluggable interpreter environment setup
//! - `SyncOrchestrator`: owner task plus concurrent workers tying it together
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::prelude::*;
//! use trellis_vfs::{SyncOrchestrator, SyncServices};
//! use std::path::Path;
//!
//! # async fn example() -> trellis_core::Result<()> {
//! let services = SyncServices::new("/tmp/trellis-projects");
//! let (orchestrator, _owner) = SyncOrchestrator::spawn(NodeGraphStore::new("Demo"), services);
//!
//! let a = orchestrator.add_node(Node::new("api", NodeKind::Backend, Framework::FastApi)).await?;
//! let b = orchestrator.add_node(Node::new("web", NodeKind::Frontend, Framework::React)).await?;
//! orchestrator.add_connection(a, b).await?;
//!
//! orchestrator.save(Path::new("/tmp/demo.trellis")).await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod environment;
pub mod exclusion;
pub mod orchestrator;
pub mod path;
pub mod project;

pub use archive::{ArchiveCodec, ArchiveReport, ArchiveSummary, ExtractedArchive, NodeSummary};
pub use environment::{
    provisioner_from_config, EnvironmentProvisioner, NoopProvisioner, ProvisionOutcome,
    VenvProvisioner,
};
pub use orchestrator::{
    LoadReport, NodeLocks, RestorePolicy, SaveReport, SyncOrchestrator, SyncServices,
};
pub use path::{RelativePath, RelativePathError};
pub use project::{FlushReport, ProjectDirectoryService};

/// Prelude module with commonly used types.
pub mod prelude {
    pub use crate::archive::{ArchiveCodec, ArchiveSummary};
    pub use crate::environment::{EnvironmentProvisioner, ProvisionOutcome};
    pub use crate::orchestrator::{
        LoadReport, RestorePolicy, SaveReport, SyncOrchestrator, SyncServices,
    };
    pub use crate::path::RelativePath;
    pub use crate::project::{FlushReport, ProjectDirectoryService};
}
