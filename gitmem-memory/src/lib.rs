//! gitmem Memory Layer
//!
//! Durable, append-only memories stored as git notes, replicated with the
//! repository's own remote and mirrored into a SQLite index for search.
//!
//! ## Features
//!
//! - **Git is the source of truth** - Every memory is an entry in a note under `refs/notes/mem/<namespace>`
//! - **Append-only** - Status changes are appended as transition entries, never rewrites
//! - **Safe sync** - Fetch into tracking refs, merge entry by entry, push without force
//! - **Rebuildable index** - SQLite rows can be verified against and repaired from the notes
//! - **Filtered vector search** - Filters run in SQL before cosine distance ranking
//! - **Lifecycle scoring** - Recency and activation decide hot/warm/cold tiers and archiving
//!
//! ## Example
//!
//! ```ignore
//! use gitmem_memory::{Domain, MemoryConfig, MemoryEntry, MemoryService, Namespace, SearchQuery};
//!
//! let config = MemoryConfig::from_env("/path/to/repo")?;
//! let service = MemoryService::open(config, None)?;
//!
//! let entry = MemoryEntry::builder(Namespace::Decisions)
//!     .summary("Use PostgreSQL for the event store")
//!     .content("JSONB columns cover the ad-hoc payloads.")
//!     .tag("database")
//!     .build()?;
//! let outcome = service.capture(Domain::Project, entry)?;
//!
//! let results = service.search(&SearchQuery::new("event store"))?;
//! let summary = service.sync(Domain::Project)?;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod git;
pub mod index;
pub mod lifecycle;
pub mod lock;
pub mod node;
pub mod note;
pub mod service;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use config::MemoryConfig;
pub use embedding::{CachedEmbedder, EmbeddingProvider, HashEmbedder};
pub use error::{MemoryError, Result};
pub use git::{GitTransport, NoteTransport};
pub use index::{DriftReport, IndexRecord, RebuildResult, SearchFilters, SecondaryIndex};
pub use lifecycle::{LifecycleConfig, LifecycleScore, LifecycleScorer, Tier};
pub use lock::{LockPolicy, RepoLock};
pub use node::{Domain, Memory, MemoryEntry, MemoryId, MemoryStatus, Namespace};
pub use note::{NoteEntry, NoteRef};
pub use service::{
    CaptureOutcome, Degradation, DomainSync, MemoryService, SearchMode, SearchQuery, SyncSummary,
};
pub use store::{CommitRef, NoteStore};
pub use sync::{SyncEngine, SyncReport, SyncState};
