//! Caller-facing facade over the stores, the index and sync
//!
//! A [`MemoryService`] owns everything one process needs: the project
//! store, the optional user store, the shared index, an optional embedding
//! provider and the lifecycle scorer. Nothing here is global; build one
//! service per repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MemoryConfig;
use crate::embedding::{embedding_text, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::index::rebuild::{self, DriftReport, RebuildResult};
use crate::index::search::{SearchFilters, MAX_RESULTS};
use crate::index::{IndexRecord, IndexStats, SecondaryIndex};
use crate::lifecycle::LifecycleScorer;
use crate::node::{Domain, Memory, MemoryEntry, MemoryId, MemoryStatus, Namespace};
use crate::store::{CommitRef, NoteStore};
use crate::sync::{RefspecMigration, SyncEngine, SyncReport};

/// Something that went wrong after the note was committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum Degradation {
    /// No embedding provider is configured
    EmbeddingUnavailable,
    EmbeddingFailed(String),
    /// The note is committed but the index row is stale; `repair` fixes it
    IndexWriteFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub memory: Memory,
    #[serde(serialize_with = "serialize_commit")]
    pub commit: CommitRef,
    pub degradations: Vec<Degradation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub id: MemoryId,
    pub status: MemoryStatus,
    pub redacted: bool,
    #[serde(serialize_with = "serialize_commit")]
    pub commit: CommitRef,
    pub degradations: Vec<Degradation>,
}

fn serialize_commit<S: serde::Serializer>(commit: &CommitRef, s: S) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut st = s.serialize_struct("CommitRef", 3)?;
    st.serialize_field("note_ref", &commit.note_ref.to_string())?;
    st.serialize_field("object", &commit.object)?;
    st.serialize_field("key", &commit.key)?;
    st.end()
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    pub filters: SearchFilters,
    /// Falls back to the configured limit when zero
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: SearchFilters::live(),
            limit: 0,
        }
    }

    pub fn filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Text,
    /// Vector hits plus substring matches among rows without a vector
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: IndexRecord,
    /// Cosine distance; absent for substring matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub domain: Domain,
    pub report: SyncReport,
    pub reindex: RebuildResult,
}

/// What syncing one domain came to
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DomainSync {
    Synced(SyncSummary),
    /// The domain's repository has no such remote
    Skipped { domain: Domain, reason: String },
    Failed { domain: Domain, error: String },
}

impl DomainSync {
    fn from_result(domain: Domain, result: Result<SyncSummary>) -> Self {
        match result {
            Ok(summary) => Self::Synced(summary),
            Err(e) => {
                log::warn!("Sync of {} failed: {}", domain, e);
                Self::Failed {
                    domain,
                    error: e.to_string(),
                }
            }
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Self::Synced(summary) => summary.domain,
            Self::Skipped { domain, .. } | Self::Failed { domain, .. } => *domain,
        }
    }

    /// The failure of the domain or of its first failed namespace
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Synced(summary) => summary.report.first_error().map(|e| e.to_string()),
            Self::Skipped { .. } => None,
            Self::Failed { error, .. } => Some(error.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReembedResult {
    pub embedded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgeReport {
    pub tiers_moved: usize,
    pub archived: Vec<MemoryId>,
    /// `(id, reason)` for candidates that could not be archived
    pub failures: Vec<(String, String)>,
}

pub struct MemoryService {
    project: NoteStore,
    user: Option<NoteStore>,
    index: Arc<SecondaryIndex>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    scorer: LifecycleScorer,
    config: MemoryConfig,
}

impl MemoryService {
    /// Assemble a service from parts
    pub fn new(
        project: NoteStore,
        user: Option<NoteStore>,
        index: Arc<SecondaryIndex>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            project,
            user,
            index,
            embedder,
            scorer: LifecycleScorer::new(config.lifecycle),
            config,
        }
    }

    /// Open the stores and the index described by `config`.
    ///
    /// A corrupt index is moved aside and rebuilt from the stores.
    pub fn open(config: MemoryConfig, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        config.validate()?;
        let project = NoteStore::open(Domain::Project, &config.repo_path, config.lock)?;
        let user = match config.user_repo_path() {
            Some(path) => Some(NoteStore::open_or_init(Domain::User, path, config.lock)?),
            None => None,
        };

        let index_path = config.index_path_for(&project.transport().git_dir()?);
        let (index, recovered) = open_index(&index_path)?;

        let service = Self::new(project, user, Arc::new(index), embedder, config);
        if recovered {
            for store in service.stores() {
                let result = service.repair(store.domain())?;
                log::info!(
                    "Recovered {} index: {} memories from the note store",
                    store.domain(),
                    result.indexed
                );
            }
        }
        Ok(service)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<SecondaryIndex> {
        &self.index
    }

    pub fn scorer(&self) -> &LifecycleScorer {
        &self.scorer
    }

    pub fn store(&self, domain: Domain) -> Result<&NoteStore> {
        match domain {
            Domain::Project => Ok(&self.project),
            Domain::User => self
                .user
                .as_ref()
                .ok_or_else(|| MemoryError::validation("the user domain is disabled")),
        }
    }

    /// Every configured store, project first
    pub fn stores(&self) -> impl Iterator<Item = &NoteStore> {
        std::iter::once(&self.project).chain(self.user.as_ref())
    }

    fn embedder(&self) -> Option<&dyn EmbeddingProvider> {
        self.embedder.as_deref()
    }

    /// Commit a memory, then index it.
    ///
    /// An error means nothing was written. Once the note is committed the
    /// capture succeeds; embedding and index failures are reported as
    /// degradations.
    pub fn capture(&self, domain: Domain, entry: MemoryEntry) -> Result<CaptureOutcome> {
        let store = self.store(domain)?;
        let commit = store.append(&entry)?;
        let id = MemoryId::new(domain, entry.namespace, commit.object.clone(), commit.key.clone())?;
        let memory = Memory::from_entry(id, entry);

        let mut degradations = Vec::new();
        let mut record = IndexRecord::new(memory.clone());
        match self.embedder() {
            None => degradations.push(Degradation::EmbeddingUnavailable),
            Some(embedder) => match embedder.embed(&embedding_text(&memory)) {
                Ok(vector) => record = record.with_embedding(vector),
                Err(e) => {
                    log::warn!("Embedding {} failed: {}", memory.id, e);
                    degradations.push(Degradation::EmbeddingFailed(e.to_string()));
                }
            },
        }
        if let Err(e) = self.index.upsert(&record) {
            log::warn!("Indexing {} failed: {}", memory.id, e);
            degradations.push(Degradation::IndexWriteFailed(e.to_string()));
        }

        log::info!("Captured {}", memory.id);
        Ok(CaptureOutcome {
            memory,
            commit,
            degradations,
        })
    }

    /// Search the index.
    ///
    /// Uses vector search when a provider is available and the query embeds.
    /// Rows the vector search cannot rank (no embedding, or one of another
    /// size) are still matched by substring and take precedence over the
    /// weakest vector hits. Without a query vector, substring search only.
    /// Every returned row counts as one access.
    pub fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let limit = if query.limit == 0 {
            self.config.search_limit
        } else {
            query.limit
        }
        .min(MAX_RESULTS);

        let query_vector = match self.embedder().map(|e| e.embed(&query.text)) {
            Some(Ok(vector)) => Some(vector),
            Some(Err(e)) => {
                log::warn!("Query embedding failed, using substring search: {}", e);
                None
            }
            None => None,
        };

        let text_hit = |record: IndexRecord| SearchHit {
            record,
            distance: None,
        };
        let results = match query_vector {
            None => SearchResults {
                mode: SearchMode::Text,
                hits: self
                    .index
                    .search_text(&query.text, &query.filters, limit)?
                    .into_iter()
                    .map(text_hit)
                    .collect(),
            },
            Some(vector) => {
                let unranked = self.index.search_text_unranked(
                    &query.text,
                    vector.len(),
                    &query.filters,
                    limit,
                )?;
                let ranked = self.index.search_vector(
                    &vector,
                    limit - unranked.len(),
                    &query.filters,
                )?;
                let mode = match (ranked.is_empty(), unranked.is_empty()) {
                    (false, true) => SearchMode::Vector,
                    (true, _) => SearchMode::Text,
                    (false, false) => SearchMode::Hybrid,
                };
                let mut hits: Vec<SearchHit> = ranked
                    .into_iter()
                    .map(|h| SearchHit {
                        record: h.record,
                        distance: Some(h.distance),
                    })
                    .collect();
                hits.extend(unranked.into_iter().map(text_hit));
                SearchResults { mode, hits }
            }
        };

        let ids: Vec<MemoryId> = results.hits.iter().map(|h| h.record.id().clone()).collect();
        if let Err(e) = self.index.record_access(&ids, Utc::now()) {
            log::warn!("Recording access failed: {}", e);
        }
        Ok(results)
    }

    /// Fetch, merge and push every namespace of a domain, then reindex the
    /// namespaces whose local ref moved.
    pub fn sync(&self, domain: Domain) -> Result<SyncSummary> {
        let store = self.store(domain)?;
        let engine = SyncEngine::new(Arc::clone(store.transport()), self.config.remote.clone())?;
        let report = engine.run(&Namespace::ALL)?;

        let changed = report.changed();
        let reindex = rebuild::reindex_namespaces(
            &self.index,
            store,
            &changed,
            self.embedder(),
            self.config.chunk_size,
        )?;
        if !changed.is_empty() {
            log::info!(
                "Sync moved {} {} namespaces; reindexed {} memories",
                changed.len(),
                domain,
                reindex.indexed
            );
        }
        Ok(SyncSummary {
            domain,
            report,
            reindex,
        })
    }

    /// [`sync`](Self::sync) one domain, capturing a failure instead of
    /// returning it
    pub fn sync_domain(&self, domain: Domain) -> DomainSync {
        DomainSync::from_result(domain, self.sync(domain))
    }

    /// Sync every configured domain whose repository has the remote.
    ///
    /// A domain without the remote is skipped and a failing domain does not
    /// stop the others.
    pub fn sync_all(&self) -> Vec<DomainSync> {
        let remote = &self.config.remote;
        self.stores()
            .map(|store| {
                let domain = store.domain();
                match store.transport().has_remote(remote) {
                    Ok(true) => self.sync_domain(domain),
                    Ok(false) => {
                        log::info!("Skipping {} sync: no remote named {}", domain, remote);
                        DomainSync::Skipped {
                            domain,
                            reason: format!("no remote named {remote}"),
                        }
                    }
                    Err(e) => DomainSync::from_result(domain, Err(e)),
                }
            })
            .collect()
    }

    /// Rebuild the rows of some namespaces (all when empty) in place
    pub fn reindex(&self, domain: Domain, namespaces: &[Namespace]) -> Result<RebuildResult> {
        let namespaces = if namespaces.is_empty() {
            &Namespace::ALL[..]
        } else {
            namespaces
        };
        rebuild::reindex_namespaces(
            &self.index,
            self.store(domain)?,
            namespaces,
            self.embedder(),
            self.config.chunk_size,
        )
    }

    pub fn verify(&self, domain: Domain) -> Result<DriftReport> {
        rebuild::verify(&self.index, self.store(domain)?, self.config.chunk_size)
    }

    pub fn repair(&self, domain: Domain) -> Result<RebuildResult> {
        rebuild::repair(
            &self.index,
            self.store(domain)?,
            self.embedder(),
            self.config.chunk_size,
        )
    }

    /// Embed every row that has no vector yet
    pub fn reembed(&self) -> Result<ReembedResult> {
        let embedder = self
            .embedder()
            .ok_or_else(|| MemoryError::embedding("no embedding provider configured"))?;
        let (embedded, failed) = rebuild::fill_missing_embeddings(&self.index, embedder, None)?;
        Ok(ReembedResult { embedded, failed })
    }

    /// Change a memory's status: append a transition entry, then update the row
    pub fn transition_status(
        &self,
        id: &MemoryId,
        status: MemoryStatus,
        redact: bool,
    ) -> Result<TransitionOutcome> {
        let store = self.store(id.domain)?;
        if self.index.get(id)?.is_none() && !store.memories(id.namespace)?.iter().any(|m| m.id == *id) {
            return Err(MemoryError::not_found(id.to_string()));
        }

        let commit = store.append_status_change(id, status, redact, Utc::now())?;

        let mut degradations = Vec::new();
        let indexed = self.index.update_status(id, status).and_then(|found| {
            if found && redact {
                self.index.redact(id)?;
            }
            Ok(found)
        });
        match indexed {
            Ok(true) => {}
            Ok(false) => degradations.push(Degradation::IndexWriteFailed(
                "memory is not indexed".to_string(),
            )),
            Err(e) => {
                log::warn!("Index update for {} failed: {}", id, e);
                degradations.push(Degradation::IndexWriteFailed(e.to_string()));
            }
        }

        log::info!("{} is now {}", id, status);
        Ok(TransitionOutcome {
            id: id.clone(),
            status,
            redacted: redact,
            commit,
            degradations,
        })
    }

    /// Recompute tiers and archive memories past their retention
    pub fn age(&self, now: DateTime<Utc>) -> Result<AgeReport> {
        let mut report = AgeReport {
            tiers_moved: self.index.refresh_tiers(&self.scorer, now)?,
            ..AgeReport::default()
        };

        let records = self.index.scan(&SearchFilters::live())?;
        for candidate in self.scorer.archive_candidates(&records, now) {
            let id = candidate.id();
            if self.store(id.domain).is_err() {
                continue;
            }
            match self.transition_status(id, MemoryStatus::Archived, false) {
                Ok(_) => report.archived.push(id.clone()),
                Err(e) => {
                    log::warn!("Archiving {} failed: {}", id, e);
                    report.failures.push((id.to_string(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Replace legacy fetch refspecs in a domain's repository
    pub fn migrate_fetch_config(&self, domain: Domain) -> Result<RefspecMigration> {
        let store = self.store(domain)?;
        crate::sync::migrate_fetch_config(store.transport().as_ref(), &self.config.remote)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.index.stats()
    }
}

/// Open the index, moving a corrupt database aside. The flag reports
/// whether a fresh database had to be created.
fn open_index(path: &Path) -> Result<(SecondaryIndex, bool)> {
    match SecondaryIndex::open(path) {
        Ok(index) => Ok((index, false)),
        Err(MemoryError::IndexCorruption(reason)) => {
            let aside = corrupt_path(path, Utc::now());
            log::warn!(
                "Index at {} is unusable ({}); moving it to {}",
                path.display(),
                reason,
                aside.display()
            );
            std::fs::rename(path, &aside)?;
            for suffix in ["-wal", "-shm"] {
                let sidecar = sibling(path, suffix);
                if sidecar.exists() {
                    std::fs::remove_file(&sidecar)?;
                }
            }
            Ok((SecondaryIndex::open(path)?, true))
        }
        Err(e) => Err(e),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn corrupt_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    sibling(path, &format!(".corrupt-{}", now.timestamp()))
}
