//! Append-only note store
//!
//! Memories live as git notes attached to commits, one notes ref per
//! namespace. Appends go to the note on the current `HEAD` commit under the
//! repository lock; nothing is ever rewritten except by sync merges.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::git::{GitTransport, NoteTransport};
use crate::lock::{LockPolicy, RepoLock};
use crate::node::{Domain, Memory, MemoryEntry, MemoryId, MemoryStatus, Namespace};
use crate::note::{self, NoteEntry, NoteRef, StatusChange, StoredEntry};

/// Where an append landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub note_ref: NoteRef,
    pub object: String,
    /// Entry key of the appended block
    pub key: String,
}

/// One entry read back from a notes ref
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRecord {
    pub namespace: Namespace,
    pub object: String,
    pub key: String,
    /// Position within the note, for ordering only
    pub position: u32,
    pub entry: NoteEntry,
}

impl NoteRecord {
    /// Interpret the entry within `domain`
    pub fn interpret(&self, domain: Domain) -> Result<StoredEntry> {
        self.entry
            .interpret(domain, self.namespace, &self.object, &self.key)
    }

    /// "Oldest first": timestamp, then object, then position
    fn cmp_age(&self, other: &Self) -> std::cmp::Ordering {
        self.entry
            .timestamp_str()
            .cmp(other.entry.timestamp_str())
            .then_with(|| self.object.cmp(&other.object))
            .then_with(|| self.position.cmp(&other.position))
    }
}

/// Totals from [`NoteStore::for_each_chunk`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub chunks: usize,
    pub entries: usize,
    pub notes: usize,
}

/// Git-notes-backed memory store for one domain
pub struct NoteStore {
    domain: Domain,
    transport: Arc<dyn NoteTransport>,
    lock: RepoLock,
}

impl NoteStore {
    pub fn new(domain: Domain, transport: Arc<dyn NoteTransport>, lock: RepoLock) -> Self {
        Self {
            domain,
            transport,
            lock,
        }
    }

    /// Store backed by an existing git repository
    pub fn open(domain: Domain, repo_path: &Path, policy: LockPolicy) -> Result<Self> {
        let transport = GitTransport::open(repo_path)?;
        Self::with_git(domain, transport, policy)
    }

    /// Store backed by the repository at `repo_path`, created if missing
    pub fn open_or_init(domain: Domain, repo_path: &Path, policy: LockPolicy) -> Result<Self> {
        let transport = GitTransport::open_or_init(repo_path)?;
        Self::with_git(domain, transport, policy)
    }

    fn with_git(domain: Domain, transport: GitTransport, policy: LockPolicy) -> Result<Self> {
        let lock = RepoLock::for_git_dir(&transport.git_dir()?, policy);
        Ok(Self::new(domain, Arc::new(transport), lock))
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn transport(&self) -> &Arc<dyn NoteTransport> {
        &self.transport
    }

    pub fn lock(&self) -> &RepoLock {
        &self.lock
    }

    /// Append an entry to the note on `HEAD` under its namespace's ref
    pub fn append(&self, entry: &MemoryEntry) -> Result<CommitRef> {
        let text = note::serialize_entry(entry);
        self.append_text(entry.namespace, &text)
    }

    /// Append a status transition for `target`
    pub fn append_status_change(
        &self,
        target: &MemoryId,
        status: MemoryStatus,
        redact: bool,
        at: DateTime<Utc>,
    ) -> Result<CommitRef> {
        let text = note::serialize_status_change(target, status, redact, &at);
        self.append_text(target.namespace, &text)
    }

    /// Appending a block the note already holds is a no-op that returns the
    /// existing entry.
    fn append_text(&self, namespace: Namespace, text: &str) -> Result<CommitRef> {
        let key = note::serialized_key(text);
        let _guard = self.lock.acquire()?;

        let object = self.transport.head()?;
        let note_ref = NoteRef::live(namespace);
        let present = self
            .transport
            .read_note(&note_ref, &object)?
            .is_some_and(|existing| note::parse_keyed(&existing).iter().any(|e| e.key == key));

        if present {
            log::debug!("{}:{}:{} already in {}", namespace, object, key, note_ref);
        } else {
            self.transport.append_ref(&note_ref, &object, text)?;
            log::debug!("Appended {}:{}:{} to {}", self.domain, namespace, key, note_ref);
        }

        Ok(CommitRef {
            note_ref,
            object,
            key,
        })
    }

    /// All entries of one namespace, oldest first
    pub fn read(&self, namespace: Namespace) -> Result<Vec<NoteRecord>> {
        let mut batch = self.read_batch(&[namespace])?;
        Ok(batch.remove(&namespace).unwrap_or_default())
    }

    /// All entries of several namespaces through a single git process
    pub fn read_batch(&self, namespaces: &[Namespace]) -> Result<BTreeMap<Namespace, Vec<NoteRecord>>> {
        let refs: Vec<NoteRef> = namespaces.iter().copied().map(NoteRef::live).collect();
        let notes = self.transport.read_refs(&refs)?;

        let mut out = BTreeMap::new();
        for (note_ref, raw_notes) in notes {
            let namespace = note_ref.namespace();
            let mut records: Vec<NoteRecord> = raw_notes
                .into_iter()
                .flat_map(|raw| {
                    note::parse_keyed(&raw.text)
                        .into_iter()
                        .map(move |keyed| NoteRecord {
                            namespace,
                            object: raw.object.clone(),
                            key: keyed.key,
                            position: keyed.position,
                            entry: keyed.entry,
                        })
                })
                .collect();
            records.sort_by(NoteRecord::cmp_age);
            out.insert(namespace, records);
        }
        Ok(out)
    }

    /// Memories of one namespace with status transitions applied
    pub fn memories(&self, namespace: Namespace) -> Result<Vec<Memory>> {
        let mut memories = Vec::new();
        let mut changes = Vec::new();
        for record in self.read(namespace)? {
            match record.interpret(self.domain)? {
                StoredEntry::Memory(memory) => memories.push(memory),
                StoredEntry::StatusChange(change) => changes.push(change),
            }
        }
        apply_status_changes(&mut memories, &changes);
        Ok(memories)
    }

    /// Stream interpreted entries in chunks of at most `chunk_size`.
    ///
    /// Refs are listed one at a time; note blobs are then read one chunk at a
    /// time so memory stays bounded by the chunk size and the note count of a
    /// single ref rather than the store size.
    pub fn for_each_chunk<F>(
        &self,
        namespaces: &[Namespace],
        chunk_size: usize,
        mut f: F,
    ) -> Result<ChunkStats>
    where
        F: FnMut(Vec<StoredEntry>) -> Result<()>,
    {
        let chunk_size = chunk_size.max(1);
        let mut stats = ChunkStats::default();
        let mut batch: Vec<StoredEntry> = Vec::with_capacity(chunk_size);

        for namespace in namespaces {
            let note_ref = NoteRef::live(*namespace);
            let listing = self.transport.list_refs(&[note_ref])?;
            let addrs = listing.get(&note_ref).map_or(&[][..], Vec::as_slice);

            for addrs in addrs.chunks(chunk_size) {
                let blobs: Vec<String> = addrs.iter().map(|a| a.blob.clone()).collect();
                let texts = self.transport.read_blobs(&blobs)?;

                for (addr, text) in addrs.iter().zip(texts) {
                    stats.notes += 1;
                    for keyed in note::parse_keyed(&text) {
                        batch.push(keyed.entry.interpret(
                            self.domain,
                            *namespace,
                            &addr.object,
                            &keyed.key,
                        )?);
                        if batch.len() == chunk_size {
                            stats.chunks += 1;
                            stats.entries += batch.len();
                            f(std::mem::replace(&mut batch, Vec::with_capacity(chunk_size)))?;
                        }
                    }
                }
            }
        }

        if !batch.is_empty() {
            stats.chunks += 1;
            stats.entries += batch.len();
            f(batch)?;
        }
        Ok(stats)
    }

    /// Tip of a namespace's live ref
    pub fn tip(&self, namespace: Namespace) -> Result<Option<String>> {
        self.transport.resolve_ref(&NoteRef::live(namespace))
    }
}

/// Apply status transitions in timestamp order; later transitions win
pub fn apply_status_changes(memories: &mut [Memory], changes: &[StatusChange]) {
    let mut ordered: Vec<&StatusChange> = changes.iter().collect();
    ordered.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));

    for change in ordered {
        if let Some(memory) = memories.iter_mut().find(|m| m.id == change.target) {
            memory.status = change.status;
            if change.redact {
                memory.content = note::format::REDACTED_BODY.to_string();
            }
        }
    }
}
