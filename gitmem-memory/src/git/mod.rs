//! Git access behind the [`NoteTransport`] seam
//!
//! [`GitTransport`] drives the `git` CLI. Tests substitute an in-memory
//! implementation.

pub mod cat_file;
pub mod executor;
pub mod transport;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::note::NoteRef;

pub use cat_file::CatFileSession;
pub use executor::GitExecutor;
pub use transport::GitTransport;

/// Location of one note: the annotated object and the blob holding its text
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteAddr {
    pub object: String,
    pub blob: String,
}

/// Note text attached to one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNote {
    pub object: String,
    pub text: String,
}

/// Result of fetching one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The tracking ref now mirrors the remote ref
    Fetched,
    /// The remote has no such ref
    RemoteMissing,
}

/// Result of pushing one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Pushed,
    /// The local ref does not exist
    NothingToPush,
}

/// Everything the store and the sync engine need from git
pub trait NoteTransport: Send + Sync {
    /// Commit `HEAD` points at; [`RepositoryState`](crate::MemoryError::RepositoryState)
    /// when there is none
    fn head(&self) -> Result<String>;

    /// Absolute path of the git directory
    fn git_dir(&self) -> Result<PathBuf>;

    /// Current tip of a ref, `None` when it does not exist
    fn resolve_ref(&self, note_ref: &NoteRef) -> Result<Option<String>>;

    /// Note text attached to `object`, `None` when there is no note
    fn read_note(&self, note_ref: &NoteRef, object: &str) -> Result<Option<String>>;

    /// Append `text` to the note on `object`, creating it if needed
    fn append_ref(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()>;

    /// Replace the note on `object` with `text`
    fn write_note(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()>;

    /// Notes of every ref, missing refs mapping to an empty list
    fn list_refs(&self, refs: &[NoteRef]) -> Result<BTreeMap<NoteRef, Vec<NoteAddr>>>;

    /// Blob contents in request order
    fn read_blobs(&self, blobs: &[String]) -> Result<Vec<String>>;

    /// Every note of every ref
    fn read_refs(&self, refs: &[NoteRef]) -> Result<BTreeMap<NoteRef, Vec<RawNote>>> {
        let listing = self.list_refs(refs)?;
        let blobs: Vec<String> = listing
            .values()
            .flat_map(|addrs| addrs.iter().map(|a| a.blob.clone()))
            .collect();
        let mut texts = self.read_blobs(&blobs)?.into_iter();

        let mut notes = BTreeMap::new();
        for (note_ref, addrs) in listing {
            let raw = addrs
                .into_iter()
                .zip(texts.by_ref())
                .map(|(addr, text)| RawNote {
                    object: addr.object,
                    text,
                })
                .collect();
            notes.insert(note_ref, raw);
        }
        Ok(notes)
    }

    fn has_remote(&self, remote: &str) -> Result<bool>;

    /// Fetch the remote's live ref for `note_ref`'s namespace into its tracking ref
    fn fetch_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<FetchStatus>;

    /// Merge `tracking` into `local`, keeping the local note wherever both
    /// sides annotate the same object. The result descends from both tips.
    fn merge_refs(&self, local: &NoteRef, tracking: &NoteRef) -> Result<()>;

    /// Non-forced push of the local live ref
    fn push_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<PushStatus>;

    /// All values of a config key, empty when unset
    fn config_values(&self, key: &str) -> Result<Vec<String>>;

    fn config_add(&self, key: &str, value: &str) -> Result<()>;

    /// Remove every value of `key` equal to `value`
    fn config_remove(&self, key: &str, value: &str) -> Result<()>;
}
