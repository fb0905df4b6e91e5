//! Drift detection and index rebuilds
//!
//! The note store is authoritative. [`verify`] compares the two sides
//! without writing; [`repair`] and [`reindex_namespaces`] rebuild rows from
//! the store in bounded chunks and replay status transitions afterwards.
//! Neither keeps per-memory state in process memory across chunks.

use chrono::Utc;
use serde::Serialize;

use crate::embedding::{embedding_text, EmbeddingProvider};
use crate::error::Result;
use crate::index::{IndexRecord, SecondaryIndex};
use crate::node::{Memory, MemoryId, Namespace};
use crate::note::{StatusChange, StoredEntry};
use crate::store::NoteStore;

/// Batch size used when filling in missing embeddings
const EMBED_BATCH: usize = 64;

/// Differences between the store and the index for one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// In the store, not in the index
    pub missing_in_index: Vec<String>,
    /// In the index, not in the store
    pub orphaned_in_index: Vec<String>,
    /// In both, with different summary, content or status
    pub mismatched: Vec<String>,
    pub store_entries: usize,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_in_index.is_empty()
            && self.orphaned_in_index.is_empty()
            && self.mismatched.is_empty()
    }
}

/// Outcome of a rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildResult {
    pub indexed: usize,
    pub status_changes: usize,
    pub removed: usize,
    pub embedded: usize,
    pub embedding_failures: usize,
    pub chunks: usize,
}

/// Compare the store with the index. Reads both sides and writes neither;
/// bookkeeping goes to scratch tables dropped on return.
pub fn verify(index: &SecondaryIndex, store: &NoteStore, chunk_size: usize) -> Result<DriftReport> {
    let domain = store.domain();
    let mut report = DriftReport::default();
    let scratch = index.scratch()?;

    store.for_each_chunk(&Namespace::ALL, chunk_size, |chunk| {
        let (memories, changes) = split_chunk(chunk);
        scratch.record_changes(&changes)?;
        scratch.record_seen(&memories)?;

        let keys: Vec<String> = memories.iter().map(|m| m.id.to_string()).collect();
        let indexed = index.get_by_keys(&keys)?;
        let mut content_differs = Vec::new();
        for (memory, key) in memories.iter().zip(keys) {
            report.store_entries += 1;
            match indexed.get(&key) {
                None => report.missing_in_index.push(key),
                Some(row) if row.memory.summary != memory.summary => report.mismatched.push(key),
                Some(row) if row.memory.content != memory.content => content_differs.push(key),
                Some(_) => {}
            }
        }
        scratch.mark_content_differs(&content_differs)
    })?;

    // Redacted rows legitimately differ from the note body
    report.mismatched.extend(scratch.content_drift()?);
    report.mismatched.extend(scratch.status_drift()?);
    report.orphaned_in_index = scratch.unseen(domain)?;

    report.missing_in_index.sort();
    report.mismatched.sort();
    report.mismatched.dedup();
    if !report.is_clean() {
        log::info!(
            "{} index drift: {} missing, {} orphaned, {} mismatched",
            domain,
            report.missing_in_index.len(),
            report.orphaned_in_index.len(),
            report.mismatched.len()
        );
    }
    Ok(report)
}

fn split_chunk(chunk: Vec<StoredEntry>) -> (Vec<Memory>, Vec<StatusChange>) {
    let mut memories = Vec::with_capacity(chunk.len());
    let mut changes = Vec::new();
    for entry in chunk {
        match entry {
            StoredEntry::Memory(memory) => memories.push(memory),
            StoredEntry::StatusChange(change) => changes.push(change),
        }
    }
    (memories, changes)
}

/// Drop every row of the store's domain and rebuild it from the store
pub fn repair(
    index: &SecondaryIndex,
    store: &NoteStore,
    embedder: Option<&dyn EmbeddingProvider>,
    chunk_size: usize,
) -> Result<RebuildResult> {
    let removed = index.delete_domain(store.domain())?;
    let mut result = rebuild(index, store, &Namespace::ALL, embedder, chunk_size)?;
    result.removed += removed;
    log::info!(
        "Rebuilt {} index: {} memories, {} status changes",
        store.domain(),
        result.indexed,
        result.status_changes
    );
    Ok(result)
}

/// Rebuild the rows of some namespaces in place.
///
/// Rows are upserted (activation counts survive, embeddings survive when
/// the text is unchanged) and rows no longer present in the store removed.
pub fn reindex_namespaces(
    index: &SecondaryIndex,
    store: &NoteStore,
    namespaces: &[Namespace],
    embedder: Option<&dyn EmbeddingProvider>,
    chunk_size: usize,
) -> Result<RebuildResult> {
    if namespaces.is_empty() {
        return Ok(RebuildResult::default());
    }
    rebuild(index, store, namespaces, embedder, chunk_size)
}

/// Upserts chunk by chunk, then removes rows the store no longer has and
/// replays status transitions once every target is indexed.
fn rebuild(
    index: &SecondaryIndex,
    store: &NoteStore,
    namespaces: &[Namespace],
    embedder: Option<&dyn EmbeddingProvider>,
    chunk_size: usize,
) -> Result<RebuildResult> {
    let mut result = RebuildResult::default();
    let scratch = index.scratch()?;
    let indexed_at = Utc::now();

    let stats = store.for_each_chunk(namespaces, chunk_size, |chunk| {
        let (memories, changes) = split_chunk(chunk);
        scratch.record_changes(&changes)?;
        scratch.record_seen(&memories)?;

        let records: Vec<IndexRecord> = memories
            .into_iter()
            .map(|memory| {
                let mut record = IndexRecord::new(memory);
                record.indexed_at = indexed_at;
                record
            })
            .collect();
        result.indexed += records.len();
        index.upsert_batch(&records)
    })?;
    result.chunks = stats.chunks;

    result.removed = scratch.delete_unseen(store.domain(), namespaces)?;
    result.status_changes = scratch.apply_changes()?;
    drop(scratch);

    if let Some(embedder) = embedder {
        let (embedded, failed) = fill_missing_embeddings(index, embedder, Some(store.domain()))?;
        result.embedded = embedded;
        result.embedding_failures = failed;
    }
    Ok(result)
}

/// Embed rows that have no vector yet; returns `(embedded, failed)`
pub fn fill_missing_embeddings(
    index: &SecondaryIndex,
    embedder: &dyn EmbeddingProvider,
    domain: Option<crate::node::Domain>,
) -> Result<(usize, usize)> {
    let mut embedded = 0;
    let mut failed = 0;
    let mut after: Option<MemoryId> = None;

    loop {
        let batch = index.ids_missing_embedding(domain, after.as_ref(), EMBED_BATCH)?;
        let Some(last) = batch.last() else {
            break;
        };
        after = Some(last.clone());
        let records = index.get_many(&batch)?;
        let texts: Vec<String> = records.iter().map(|r| embedding_text(&r.memory)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        match embedder.embed_batch(&refs) {
            Ok(vectors) => {
                for (record, vector) in records.iter().zip(vectors) {
                    if index.set_embedding(record.id(), &vector)? {
                        embedded += 1;
                    }
                }
            }
            Err(e) => {
                log::warn!("Embedding batch of {} failed: {}", records.len(), e);
                failed += records.len();
            }
        }
    }
    Ok((embedded, failed))
}
