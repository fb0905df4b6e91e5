mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use gitmem_memory::embedding::EmbeddingProvider;
use gitmem_memory::{
    CachedEmbedder, Degradation, Domain, HashEmbedder, MemoryEntry, MemoryError, MemoryId,
    MemoryStatus, Namespace, SearchFilters, SearchMode, SearchQuery, Tier,
};

use common::{entry, fake_service, FakeTransport};

struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn dimension(&self) -> usize {
        8
    }

    fn embed(&self, _text: &str) -> gitmem_memory::Result<Vec<f32>> {
        Err(MemoryError::embedding("model not loaded"))
    }
}

/// Fails for texts containing `fail_on`, embeds everything else
struct SelectiveEmbedder {
    inner: HashEmbedder,
    fail_on: &'static str,
}

impl EmbeddingProvider for SelectiveEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> gitmem_memory::Result<Vec<f32>> {
        if text.contains(self.fail_on) {
            return Err(MemoryError::embedding("input rejected"));
        }
        self.inner.embed(text)
    }
}

fn hashing() -> Option<Arc<dyn EmbeddingProvider>> {
    Some(Arc::new(CachedEmbedder::new(Arc::new(HashEmbedder::default()))))
}

#[test]
fn capture_then_search_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), fake, hashing());

    let outcome = service
        .capture(
            Domain::Project,
            MemoryEntry::builder(Namespace::Learnings)
                .summary("Postgres replication lag fix")
                .content("Raise wal_keep_size on the primary.")
                .tag("postgres")
                .build()
                .unwrap(),
        )
        .unwrap();
    assert!(outcome.degradations.is_empty());
    assert_eq!(outcome.memory.id.key, outcome.commit.key);
    for summary in ["Frontend button colors", "Release checklist"] {
        service
            .capture(Domain::Project, entry(Namespace::Learnings, summary, 1))
            .unwrap();
    }

    let results = service
        .search(&SearchQuery::new("postgres replication"))
        .unwrap();
    assert_eq!(results.mode, SearchMode::Vector);
    assert_eq!(results.hits[0].record.memory.id, outcome.memory.id);
    assert!(results.hits[0].distance.unwrap() < 1.0);

    // Returned rows count as accesses
    let row = service.index().get(&outcome.memory.id).unwrap().unwrap();
    assert_eq!(row.activation_count, 1);
    assert!(row.last_accessed_at.is_some());
    assert_eq!(row.memory, outcome.memory);
}

#[test]
fn search_without_embedder_uses_substring_match() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), fake, None);

    let outcome = service
        .capture(Domain::Project, entry(Namespace::Research, "Vendor comparison", 1))
        .unwrap();
    assert_eq!(outcome.degradations, vec![Degradation::EmbeddingUnavailable]);

    let results = service.search(&SearchQuery::new("vendor")).unwrap();
    assert_eq!(results.mode, SearchMode::Text);
    assert_eq!(results.hits.len(), 1);
    assert!(results.hits[0].distance.is_none());
}

#[test]
fn embedding_failure_degrades_but_commits() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), Arc::clone(&fake), Some(Arc::new(FailingEmbedder)));

    let outcome = service
        .capture(Domain::Project, entry(Namespace::Progress, "Sprint 4 done", 1))
        .unwrap();
    assert!(matches!(
        outcome.degradations.as_slice(),
        [Degradation::EmbeddingFailed(reason)] if reason.contains("model not loaded")
    ));
    assert!(fake
        .read_note_text(Namespace::Progress, &outcome.commit.object)
        .unwrap()
        .contains("Sprint 4 done"));

    // Query embedding fails too; substring search still answers
    let results = service.search(&SearchQuery::new("sprint")).unwrap();
    assert_eq!(results.mode, SearchMode::Text);
    assert_eq!(results.hits.len(), 1);
}

#[test]
fn memories_without_vectors_stay_searchable() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let embedder = SelectiveEmbedder {
        inner: HashEmbedder::default(),
        fail_on: "Use PostgreSQL",
    };
    let service = fake_service(dir.path(), fake, Some(Arc::new(embedder)));

    let embedded = service
        .capture(Domain::Project, entry(Namespace::Decisions, "Frontend button colors", 1))
        .unwrap();
    assert!(embedded.degradations.is_empty());
    let degraded = service
        .capture(Domain::Project, entry(Namespace::Decisions, "Use PostgreSQL", 2))
        .unwrap();
    assert!(matches!(
        degraded.degradations.as_slice(),
        [Degradation::EmbeddingFailed(_)]
    ));

    let results = service.search(&SearchQuery::new("PostgreSQL")).unwrap();
    assert_eq!(results.mode, SearchMode::Hybrid);
    let hit = results
        .hits
        .iter()
        .find(|h| h.record.memory.id == degraded.memory.id)
        .unwrap();
    assert!(hit.distance.is_none());

    // Substring matches are not crowded out by ranked rows
    let top = service
        .search(&SearchQuery::new("PostgreSQL").limit(1))
        .unwrap();
    assert_eq!(top.hits.len(), 1);
    assert_eq!(top.hits[0].record.memory.id, degraded.memory.id);
}

#[test]
fn capture_into_disabled_user_domain_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), Arc::clone(&fake), None);

    let err = service
        .capture(Domain::User, entry(Namespace::Learnings, "global", 1))
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    assert_eq!(service.stats().unwrap().total, 0);
}

#[test]
fn filters_apply_before_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), fake, hashing());

    for i in 0..20 {
        service
            .capture(
                Domain::Project,
                entry(Namespace::Progress, &format!("deploy pipeline step {i}"), i),
            )
            .unwrap();
    }
    let wanted = service
        .capture(Domain::Project, entry(Namespace::Decisions, "unrelated wording", 30))
        .unwrap();

    let results = service
        .search(
            &SearchQuery::new("deploy pipeline step")
                .filters(SearchFilters::live().namespace(Namespace::Decisions))
                .limit(1),
        )
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].record.memory.id, wanted.memory.id);
}

#[test]
fn transition_appends_and_updates_index() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), Arc::clone(&fake), hashing());

    let captured = service
        .capture(Domain::Project, entry(Namespace::Blockers, "Leaked token in logs", 1))
        .unwrap();
    let id = captured.memory.id.clone();

    fake.commit();
    let outcome = service
        .transition_status(&id, MemoryStatus::Tombstoned, true)
        .unwrap();
    assert!(outcome.degradations.is_empty());
    assert_ne!(outcome.commit.object, id.object);

    let row = service.index().get(&id).unwrap().unwrap();
    assert_eq!(row.memory.status, MemoryStatus::Tombstoned);
    assert_eq!(row.tier, Tier::Archived);
    assert_eq!(row.memory.content, "[redacted]");
    assert!(row.embedding.is_none());

    // Live searches no longer see it
    let results = service.search(&SearchQuery::new("leaked token")).unwrap();
    assert!(results.hits.iter().all(|h| h.record.memory.id != id));

    // A rebuild reaches the same state
    service.repair(Domain::Project).unwrap();
    let rebuilt = service.index().get(&id).unwrap().unwrap();
    assert_eq!(rebuilt.memory.status, MemoryStatus::Tombstoned);
    assert_eq!(rebuilt.memory.content, "[redacted]");
    assert!(service.verify(Domain::Project).unwrap().is_clean());
}

#[test]
fn transition_of_unknown_memory_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let object = fake.commit();
    let service = fake_service(dir.path(), fake, None);

    let id = MemoryId::new(Domain::Project, Namespace::Reviews, object, "00000000000000c3").unwrap();
    let err = service
        .transition_status(&id, MemoryStatus::Resolved, false)
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

#[test]
fn age_archives_stale_memories() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), fake, None);
    let now = Utc::now();

    let old = service
        .capture(
            Domain::Project,
            MemoryEntry::builder(Namespace::Progress)
                .summary("Migrated CI runners")
                .timestamp(now - Duration::days(400))
                .build()
                .unwrap(),
        )
        .unwrap();
    let fresh = service
        .capture(
            Domain::Project,
            MemoryEntry::builder(Namespace::Progress)
                .summary("Started the audit")
                .timestamp(now - Duration::days(1))
                .build()
                .unwrap(),
        )
        .unwrap();

    let report = service.age(now).unwrap();
    assert_eq!(report.archived, vec![old.memory.id.clone()]);
    assert!(report.failures.is_empty());

    let old_row = service.index().get(&old.memory.id).unwrap().unwrap();
    assert_eq!(old_row.memory.status, MemoryStatus::Archived);
    assert_eq!(old_row.tier, Tier::Archived);
    let fresh_row = service.index().get(&fresh.memory.id).unwrap().unwrap();
    assert_eq!(fresh_row.memory.status, MemoryStatus::Active);
    assert_eq!(fresh_row.tier, Tier::Hot);

    // The archive is recorded in the note store
    let memories = service
        .store(Domain::Project)
        .unwrap()
        .memories(Namespace::Progress)
        .unwrap();
    let archived = memories.iter().find(|m| m.id == old.memory.id).unwrap();
    assert_eq!(archived.status, MemoryStatus::Archived);

    // Nothing left to archive
    assert!(service.age(now).unwrap().archived.is_empty());
}

#[test]
fn reembed_fills_missing_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let without = fake_service(dir.path(), Arc::clone(&fake), None);
    for i in 0..3 {
        without
            .capture(Domain::Project, entry(Namespace::Patterns, &format!("pattern {i}"), i))
            .unwrap();
    }
    assert!(matches!(without.reembed(), Err(MemoryError::Embedding(_))));
    assert_eq!(without.stats().unwrap().with_embedding, 0);

    let with = fake_service(dir.path(), fake, hashing());
    with.repair(Domain::Project).unwrap();
    // Repair embeds on the way; reembed finds nothing left
    assert_eq!(with.stats().unwrap().with_embedding, 3);
    assert_eq!(with.reembed().unwrap().embedded, 0);
}

#[test]
fn stats_break_down_rows() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let service = fake_service(dir.path(), fake, None);
    service
        .capture(Domain::Project, entry(Namespace::Decisions, "one", 1))
        .unwrap();
    service
        .capture(Domain::Project, entry(Namespace::Reviews, "two", 2))
        .unwrap();

    let stats = service.stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.schema_version, 3);
    assert_eq!(stats.by_namespace.get("decisions"), Some(&1));
    assert_eq!(stats.by_domain.get("project"), Some(&2));
    assert_eq!(stats.by_status.get("active"), Some(&2));
}
