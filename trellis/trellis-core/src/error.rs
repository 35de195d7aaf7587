//! Error types for the Trellis system.

/// Result type alias for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Main error type for the Trellis system.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Project directory errors (create, write, read, copy)
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// The file is not a readable workspace archive
    #[error("Not a valid workspace archive: {0}")]
    InvalidArchive(String),

    /// Archive construction errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Environment provisioning errors
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The owner task is gone or a worker was cancelled
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrellisError {
    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new filesystem error
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    /// Create a new invalid archive error
    pub fn invalid_archive(msg: impl Into<String>) -> Self {
        Self::InvalidArchive(msg.into())
    }

    /// Create a new archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a new concurrency error
    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error means the input was not a workspace archive
    pub fn is_invalid_archive(&self) -> bool {
        matches!(self, Self::InvalidArchive(_))
    }

    /// Check if this is a filesystem error
    pub fn is_filesystem(&self) -> bool {
        matches!(self, Self::Filesystem(_) | Self::Io(_))
    }
}
