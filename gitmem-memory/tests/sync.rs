mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use gitmem_memory::note::parse_note;
use gitmem_memory::sync::{migrate_fetch_config, PhaseOutcome};
use gitmem_memory::{
    Domain, DomainSync, MemoryConfig, MemoryError, MemoryService, MemoryStatus, Namespace, NoteRef,
    NoteStore, NoteTransport, SecondaryIndex, SyncEngine, SyncState,
};

use common::{entry, fake_service, store_over, FakeRemote, FakeTransport};

struct Replica {
    fake: Arc<FakeTransport>,
    store: NoteStore,
}

impl Replica {
    fn new(root: &Path, name: &str, remote: &Arc<FakeRemote>, object: Option<&str>) -> Self {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let fake = Arc::new(FakeTransport::new(&dir));
        if let Some(object) = object {
            fake.checkout(object);
        }
        fake.attach_remote("origin", Arc::clone(remote));
        let store = store_over(Domain::Project, &dir, Arc::clone(&fake));
        Self { fake, store }
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(self.store.transport().clone(), "origin").unwrap()
    }

    fn note(&self, ns: Namespace, object: &str) -> String {
        self.fake.read_note_text(ns, object).unwrap_or_default()
    }
}

/// Two replicas sharing one checked-out commit
fn pair(root: &Path) -> (Arc<FakeRemote>, Replica, Replica, String) {
    let remote = FakeRemote::new();
    let a = Replica::new(root, "a", &remote, None);
    let object = a.fake.head().unwrap();
    let b = Replica::new(root, "b", &remote, Some(&object));
    (remote, a, b, object)
}

#[test]
fn divergent_replicas_converge() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, a, b, object) = pair(dir.path());

    a.store
        .append(&entry(Namespace::Decisions, "from a", 10))
        .unwrap();
    b.store
        .append(&entry(Namespace::Decisions, "from b", 5))
        .unwrap();

    let first = a.engine().run(&[Namespace::Decisions]).unwrap();
    assert_eq!(first.namespaces[0].state, SyncState::Pushed);
    assert_eq!(first.namespaces[0].merge, PhaseOutcome::skipped("remote ref does not exist"));

    let second = b.engine().run(&[Namespace::Decisions]).unwrap();
    let ns = &second.namespaces[0];
    assert_eq!(ns.state, SyncState::Pushed);
    assert_eq!(ns.rewritten_notes, 1);
    assert!(ns.changed);

    let third = a.engine().run(&[Namespace::Decisions]).unwrap();
    assert_eq!(third.namespaces[0].state, SyncState::Pushed);
    assert_eq!(third.changed(), vec![Namespace::Decisions]);

    let note_a = a.note(Namespace::Decisions, &object);
    let note_b = b.note(Namespace::Decisions, &object);
    assert_eq!(note_a, note_b);
    assert_eq!(
        remote.note(Namespace::Decisions, &object).unwrap(),
        note_a
    );

    let entries = parse_note(&note_a);
    assert_eq!(entries.len(), 2);
    // Merge order: by timestamp
    assert!(note_a.find("from b").unwrap() < note_a.find("from a").unwrap());

    // Nothing left to do
    let quiet = a.engine().run(&[Namespace::Decisions]).unwrap();
    assert!(quiet.changed().is_empty());
    assert_eq!(quiet.namespaces[0].merge, PhaseOutcome::skipped("already up to date"));
}

#[test]
fn merge_result_is_independent_of_sync_order() {
    let run = |a_first: bool| {
        let dir = tempfile::tempdir().unwrap();
        let (_remote, a, b, object) = pair(dir.path());
        a.store
            .append(&entry(Namespace::Reviews, "alpha", 3))
            .unwrap();
        a.store
            .append(&entry(Namespace::Reviews, "gamma", 9))
            .unwrap();
        b.store
            .append(&entry(Namespace::Reviews, "beta", 6))
            .unwrap();

        let (first, second) = if a_first { (&a, &b) } else { (&b, &a) };
        first.engine().run(&[Namespace::Reviews]).unwrap();
        second.engine().run(&[Namespace::Reviews]).unwrap();
        first.engine().run(&[Namespace::Reviews]).unwrap();

        let note = a.note(Namespace::Reviews, &object);
        assert_eq!(note, b.note(Namespace::Reviews, &object));
        note
    };

    let ab = run(true);
    let ba = run(false);
    assert_eq!(ab, ba);
    let order: Vec<usize> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|s| ab.find(s).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn missing_remote_is_repository_error() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    let engine = SyncEngine::new(fake, "origin").unwrap();
    let err = engine.run(&Namespace::ALL).unwrap_err();
    assert!(matches!(err, MemoryError::RepositoryState(_)));
}

#[test]
fn invalid_remote_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(dir.path()));
    assert!(matches!(
        SyncEngine::new(fake, "--upload-pack=evil"),
        Err(MemoryError::Validation(_))
    ));
}

#[test]
fn empty_namespaces_have_nothing_to_push() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, _b, _) = pair(dir.path());
    let report = a.engine().run(&Namespace::ALL).unwrap();

    assert_eq!(report.namespaces.len(), Namespace::ALL.len());
    assert!(report.is_success());
    for ns in &report.namespaces {
        assert_eq!(ns.state, SyncState::Fetched);
        assert_eq!(ns.push, PhaseOutcome::skipped("no local notes"));
        assert!(!ns.changed);
    }
}

#[test]
fn fetch_failure_stops_the_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, _b, _) = pair(dir.path());
    a.store
        .append(&entry(Namespace::Progress, "local only", 1))
        .unwrap();
    a.fake.fail_fetch.store(true, Ordering::SeqCst);

    let report = a.engine().run(&[Namespace::Progress]).unwrap();
    let ns = &report.namespaces[0];
    assert_eq!(ns.state, SyncState::FetchFailed);
    assert!(ns.fetch.is_failed());
    assert_eq!(ns.push, PhaseOutcome::skipped("fetch failed"));
    assert!(matches!(
        report.first_error(),
        Some(MemoryError::SyncPhase { .. })
    ));
}

#[test]
fn merge_failure_skips_push() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, b, _) = pair(dir.path());
    a.store
        .append(&entry(Namespace::Research, "a", 1))
        .unwrap();
    a.engine().run(&[Namespace::Research]).unwrap();
    b.store
        .append(&entry(Namespace::Research, "b", 2))
        .unwrap();

    b.fake.fail_merge.store(true, Ordering::SeqCst);
    let report = b.engine().run(&[Namespace::Research]).unwrap();
    let ns = &report.namespaces[0];
    assert_eq!(ns.state, SyncState::MergeFailed);
    assert_eq!(ns.push, PhaseOutcome::skipped("merge failed"));
}

#[test]
fn rejected_push_keeps_merged_state() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, a, b, object) = pair(dir.path());
    a.store
        .append(&entry(Namespace::Blockers, "a", 1))
        .unwrap();
    a.engine().run(&[Namespace::Blockers]).unwrap();
    b.store
        .append(&entry(Namespace::Blockers, "b", 2))
        .unwrap();

    b.fake.fail_push.store(true, Ordering::SeqCst);
    let report = b.engine().run(&[Namespace::Blockers]).unwrap();
    let ns = &report.namespaces[0];
    assert_eq!(ns.state, SyncState::PushFailed);
    assert!(ns.changed);
    assert_eq!(parse_note(&b.note(Namespace::Blockers, &object)).len(), 2);
    assert_eq!(
        parse_note(&remote.note(Namespace::Blockers, &object).unwrap()).len(),
        1
    );

    // The next run delivers it
    b.fake.fail_push.store(false, Ordering::SeqCst);
    let retry = b.engine().run(&[Namespace::Blockers]).unwrap();
    assert_eq!(retry.namespaces[0].state, SyncState::Pushed);
    assert_eq!(
        parse_note(&remote.note(Namespace::Blockers, &object).unwrap()).len(),
        2
    );
}

#[test]
fn tracking_ref_mirrors_remote() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, b, _) = pair(dir.path());
    a.store
        .append(&entry(Namespace::Patterns, "shared", 1))
        .unwrap();
    a.engine().run(&[Namespace::Patterns]).unwrap();
    b.engine().run(&[Namespace::Patterns]).unwrap();

    let live = NoteRef::live(Namespace::Patterns);
    assert_eq!(
        b.fake.resolve_ref(&live.to_tracking()).unwrap(),
        a.fake.resolve_ref(&live).unwrap()
    );
}

#[test]
fn legacy_fetch_refspecs_are_migrated_once() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeTransport::new(dir.path());
    let key = "remote.origin.fetch";
    fake.config_add(key, "+refs/heads/*:refs/remotes/origin/*")
        .unwrap();
    fake.config_add(key, "+refs/notes/mem/*:refs/notes/mem/*")
        .unwrap();
    fake.config_add(key, "refs/notes/mem/*:refs/notes/mem/*")
        .unwrap();

    let migration = migrate_fetch_config(&fake, "origin").unwrap();
    assert_eq!(migration.removed.len(), 2);
    assert!(migration.added);
    assert_eq!(
        fake.config_values(key).unwrap(),
        vec![
            "+refs/heads/*:refs/remotes/origin/*".to_string(),
            "+refs/notes/mem/*:refs/notes/mem/origin/*".to_string(),
        ]
    );

    let again = migrate_fetch_config(&fake, "origin").unwrap();
    assert!(again.is_noop());
}

#[test]
fn fetch_config_without_legacy_values_is_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeTransport::new(dir.path());
    fake.config_add("remote.origin.fetch", "+refs/heads/*:refs/remotes/origin/*")
        .unwrap();
    assert!(migrate_fetch_config(&fake, "origin").unwrap().is_noop());
    assert_eq!(fake.config_values("remote.origin.fetch").unwrap().len(), 1);
}

#[test]
fn service_sync_reindexes_changed_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, b, _) = pair(dir.path());
    let service_a = fake_service(&dir.path().join("a"), Arc::clone(&a.fake), None);
    let service_b = fake_service(&dir.path().join("b"), Arc::clone(&b.fake), None);

    let captured = service_a
        .capture(Domain::Project, entry(Namespace::Learnings, "flaky test root cause", 1))
        .unwrap();
    service_a.sync(Domain::Project).unwrap();

    let summary = service_b.sync(Domain::Project).unwrap();
    assert_eq!(summary.report.changed(), vec![Namespace::Learnings]);
    assert_eq!(summary.reindex.indexed, 1);

    let row = service_b.index().get(&captured.memory.id).unwrap().unwrap();
    assert_eq!(row.memory.summary, "flaky test root cause");
    assert!(service_b.verify(Domain::Project).unwrap().is_clean());
}

#[test]
fn status_changes_follow_their_memory_through_a_merge() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, b, object) = pair(dir.path());
    let service_a = fake_service(&dir.path().join("a"), Arc::clone(&a.fake), None);
    let service_b = fake_service(&dir.path().join("b"), Arc::clone(&b.fake), None);

    let from_a = service_a
        .capture(Domain::Project, entry(Namespace::Decisions, "from a", 10))
        .unwrap()
        .memory;
    service_a
        .transition_status(&from_a.id, MemoryStatus::Tombstoned, true)
        .unwrap();
    // Older than everything on a, so the merge puts it first
    let from_b = service_b
        .capture(Domain::Project, entry(Namespace::Decisions, "from b", 5))
        .unwrap()
        .memory;
    assert_eq!(from_a.id.object, from_b.id.object);

    service_a.sync(Domain::Project).unwrap();
    service_b.sync(Domain::Project).unwrap();
    service_a.sync(Domain::Project).unwrap();

    let merged = b.note(Namespace::Decisions, &object);
    assert!(merged.find("from b").unwrap() < merged.find("from a").unwrap());
    assert_eq!(merged, a.note(Namespace::Decisions, &object));

    for service in [&service_a, &service_b] {
        let kept = service.index().get(&from_b.id).unwrap().unwrap();
        assert_eq!(kept.memory.status, MemoryStatus::Active);
        assert_eq!(kept.memory.content, from_b.content);

        let gone = service.index().get(&from_a.id).unwrap().unwrap();
        assert_eq!(gone.memory.status, MemoryStatus::Tombstoned);
        assert_eq!(gone.memory.content, "[redacted]");

        assert!(service.verify(Domain::Project).unwrap().is_clean());
    }

    let memories = b.store.memories(Namespace::Decisions).unwrap();
    let ids: Vec<_> = memories.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&from_a.id) && ids.contains(&from_b.id));
}

#[test]
fn sync_all_skips_domains_without_the_remote() {
    let dir = tempfile::tempdir().unwrap();
    let (_remote, a, _b, _) = pair(dir.path());
    let project_dir = dir.path().join("a");
    let user_dir = dir.path().join("user");
    std::fs::create_dir_all(&user_dir).unwrap();

    let service = MemoryService::new(
        store_over(Domain::Project, &project_dir, Arc::clone(&a.fake)),
        Some(store_over(
            Domain::User,
            &user_dir,
            Arc::new(FakeTransport::new(&user_dir)),
        )),
        Arc::new(SecondaryIndex::in_memory().unwrap()),
        None,
        MemoryConfig::for_repo(&project_dir),
    );
    service
        .capture(Domain::Project, entry(Namespace::Progress, "shipped", 1))
        .unwrap();
    service
        .capture(Domain::User, entry(Namespace::Learnings, "personal note", 2))
        .unwrap();

    let outcomes = service.sync_all();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], DomainSync::Synced(s) if s.report.is_success()));
    assert!(matches!(
        &outcomes[1],
        DomainSync::Skipped { domain: Domain::User, .. }
    ));
    assert!(outcomes.iter().all(|o| o.error().is_none()));

    // Asking for the domain explicitly reports the failure without panicking
    let explicit = service.sync_domain(Domain::User);
    assert_eq!(explicit.domain(), Domain::User);
    assert!(explicit.error().unwrap().contains("origin"));
}

mod real_git {
    use super::*;
    use common::{git, replicas, skip_without_git};
    use gitmem_memory::lock::LockPolicy;

    fn open(path: &Path) -> NoteStore {
        NoteStore::open(Domain::Project, path, LockPolicy::default()).unwrap()
    }

    fn engine(store: &NoteStore) -> SyncEngine {
        SyncEngine::new(store.transport().clone(), "origin").unwrap()
    }

    fn show(path: &Path) -> String {
        git(
            path,
            &["notes", "--ref", "refs/notes/mem/decisions", "show", "HEAD"],
        )
    }

    #[test]
    fn divergent_clones_converge_through_bare_remote() {
        if skip_without_git() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let (remote, a, b) = replicas(root.path());
        let store_a = open(&a);
        let store_b = open(&b);

        store_a
            .append(&entry(Namespace::Decisions, "from a", 20))
            .unwrap();
        store_b
            .append(&entry(Namespace::Decisions, "from b", 10))
            .unwrap();

        let ra = engine(&store_a).run(&[Namespace::Decisions]).unwrap();
        assert_eq!(ra.namespaces[0].state, SyncState::Pushed);

        let rb = engine(&store_b).run(&[Namespace::Decisions]).unwrap();
        assert_eq!(rb.namespaces[0].state, SyncState::Pushed, "{rb:?}");
        assert_eq!(rb.namespaces[0].rewritten_notes, 1);

        let ra2 = engine(&store_a).run(&[Namespace::Decisions]).unwrap();
        assert_eq!(ra2.namespaces[0].state, SyncState::Pushed);

        let note_a = show(&a);
        assert_eq!(note_a, show(&b));
        assert!(note_a.contains("summary: from a"));
        assert!(note_a.contains("summary: from b"));
        assert!(note_a.find("from b").unwrap() < note_a.find("from a").unwrap());

        let head = git(&a, &["rev-parse", "HEAD"]);
        let on_remote = git(
            &remote,
            &["notes", "--ref", "refs/notes/mem/decisions", "show", &head],
        );
        assert_eq!(on_remote, note_a);

        // The tracking ref exists locally and live refs were never force-updated
        git(&b, &["rev-parse", "--verify", "refs/notes/mem/origin/decisions"]);
        let memories = store_a.memories(Namespace::Decisions).unwrap();
        assert_eq!(memories.len(), 2);

        let quiet = engine(&store_b).run(&[Namespace::Decisions]).unwrap();
        assert!(quiet.changed().is_empty());
    }

    #[test]
    fn missing_remote_ref_is_not_an_error() {
        if skip_without_git() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let (_remote, a, _b) = replicas(root.path());
        let store = open(&a);
        store
            .append(&entry(Namespace::Inception, "kickoff", 1))
            .unwrap();

        let report = engine(&store)
            .run(&[Namespace::Inception, Namespace::Elicitation])
            .unwrap();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.namespaces[0].state, SyncState::Pushed);
        assert_eq!(report.namespaces[1].state, SyncState::Fetched);
    }

    #[test]
    fn legacy_refspec_migration() {
        if skip_without_git() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let (_remote, a, _b) = replicas(root.path());
        git(
            &a,
            &["config", "--add", "remote.origin.fetch", "+refs/notes/mem/*:refs/notes/mem/*"],
        );
        let store = open(&a);

        let migration = migrate_fetch_config(store.transport().as_ref(), "origin").unwrap();
        assert_eq!(migration.removed, vec!["+refs/notes/mem/*:refs/notes/mem/*".to_string()]);
        assert!(migration.added);

        let values = git(&a, &["config", "--get-all", "remote.origin.fetch"]);
        let values: Vec<&str> = values.lines().collect();
        assert!(values.contains(&"+refs/notes/mem/*:refs/notes/mem/origin/*"));
        assert!(!values.contains(&"+refs/notes/mem/*:refs/notes/mem/*"));

        let again = migrate_fetch_config(store.transport().as_ref(), "origin").unwrap();
        assert!(again.is_noop());
    }
}
