//! Core types for Trellis: the node graph, its data model, the framework
//! table, errors and configuration.
//!
//! Nothing in this crate touches the disk except configuration loading; the
//! project directories and archives live in `trellis-vfs`.

pub mod config;
pub mod error;
pub mod framework;
pub mod graph;
pub mod id;
pub mod naming;
pub mod types;

pub use config::TrellisConfig;
pub use error::{Result, TrellisError};
pub use framework::{Framework, FrameworkDescriptor, FRAMEWORKS};
pub use graph::{NodeChange, NodeGraphStore};
pub use id::{FileId, NodeId};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TrellisConfig;
    pub use crate::error::{Result, TrellisError};
    pub use crate::framework::{Framework, FrameworkDescriptor};
    pub use crate::graph::{NodeChange, NodeGraphStore};
    pub use crate::id::{FileId, NodeId};
    pub use crate::types::{
        CanvasState, Connection, Language, Node, NodeKind, NodeSyncState, Position, ProjectFile,
        Workspace,
    };
}
