//! Error types for gitmem-memory

use std::path::PathBuf;
use thiserror::Error;

/// Sync protocol phase, used to scope [`MemoryError::SyncPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Fetch,
    Merge,
    Push,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fetch => "fetch",
            Self::Merge => "merge",
            Self::Push => "push",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The working tree is not a usable repository (missing, no commits, no remote)
    #[error("Repository state error: {0}")]
    RepositoryState(String),

    /// Bad namespace, identifier or argument; the caller's fault
    #[error("Validation error: {0}")]
    Validation(String),

    /// The repository lock could not be acquired within the attempt budget
    #[error("Timed out acquiring lock {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    /// One phase of a sync run failed for one namespace
    #[error("Sync {phase} failed for namespace {namespace}: {message}")]
    SyncPhase {
        namespace: String,
        phase: SyncPhase,
        message: String,
    },

    /// Index schema is unusable and must be rebuilt
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// A git invocation failed
    #[error("Git command failed: {0}")]
    Git(String),

    /// SQLite error
    #[error("Index error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Builder error
    #[error("Builder error: {0}")]
    Builder(#[from] crate::node::EntryBuilderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 decoding error
    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl MemoryError {
    /// Create a repository state error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::RepositoryState(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a git command error
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Create an index corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::IndexCorruption(msg.into())
    }

    /// Create an embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a sync phase error for one namespace
    pub fn sync_phase(namespace: impl Into<String>, phase: SyncPhase, msg: impl Into<String>) -> Self {
        Self::SyncPhase {
            namespace: namespace.into(),
            phase,
            message: msg.into(),
        }
    }

    /// Whether retrying the same call later can succeed without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::SyncPhase { .. })
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;
