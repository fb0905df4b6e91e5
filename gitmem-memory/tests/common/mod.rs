//! Shared fixtures: an in-memory `NoteTransport` and real git repositories

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use gitmem_memory::git::{FetchStatus, NoteAddr, PushStatus};
use gitmem_memory::lock::{LockPolicy, RepoLock};
use gitmem_memory::{
    Domain, MemoryEntry, MemoryError, Namespace, NoteRef, NoteStore, NoteTransport, Result,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id(prefix: u8) -> String {
    format!("{:02x}{:038x}", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Stable fake blob id for a text
fn blob_id(text: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{:016x}{:024x}", hash, text.len())
}

/// Ensure a note ends with exactly one newline, the way git stores it
fn stored(text: &str) -> String {
    format!("{}\n", text.trim_end())
}

/// One notes commit: the full object -> text mapping plus its ancestry
#[derive(Debug, Clone, Default)]
pub struct NotesCommit {
    pub id: String,
    pub notes: BTreeMap<String, String>,
    pub ancestors: BTreeSet<String>,
}

impl NotesCommit {
    fn child(&self, notes: BTreeMap<String, String>) -> Self {
        let mut ancestors = self.ancestors.clone();
        if !self.id.is_empty() {
            ancestors.insert(self.id.clone());
        }
        Self {
            id: fresh_id(0xc0),
            notes,
            ancestors,
        }
    }

    fn descends_from(&self, other: &NotesCommit) -> bool {
        self.id == other.id || self.ancestors.contains(&other.id)
    }
}

/// A bare "remote" shared by several fake replicas
#[derive(Debug, Default)]
pub struct FakeRemote {
    refs: Mutex<BTreeMap<String, NotesCommit>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn note(&self, namespace: Namespace, object: &str) -> Option<String> {
        self.refs
            .lock()
            .get(&NoteRef::live(namespace).path())
            .and_then(|c| c.notes.get(object).cloned())
    }
}

/// In-memory stand-in for a git repository's notes
pub struct FakeTransport {
    git_dir: PathBuf,
    head: Mutex<Option<String>>,
    refs: Mutex<BTreeMap<String, NotesCommit>>,
    blobs: Mutex<HashMap<String, String>>,
    config: Mutex<BTreeMap<String, Vec<String>>>,
    remote: Mutex<Option<(String, Arc<FakeRemote>)>>,
    pub fail_fetch: AtomicBool,
    pub fail_push: AtomicBool,
    pub fail_merge: AtomicBool,
    /// Size of every `read_blobs` request
    pub blob_reads: Mutex<Vec<usize>>,
}

impl FakeTransport {
    /// Repository with one commit checked out
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        let fake = Self::without_commits(git_dir);
        fake.commit();
        fake
    }

    pub fn without_commits(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            head: Mutex::new(None),
            refs: Mutex::new(BTreeMap::new()),
            blobs: Mutex::new(HashMap::new()),
            config: Mutex::new(BTreeMap::new()),
            remote: Mutex::new(None),
            fail_fetch: AtomicBool::new(false),
            fail_push: AtomicBool::new(false),
            fail_merge: AtomicBool::new(false),
            blob_reads: Mutex::new(Vec::new()),
        }
    }

    /// Move `HEAD` to a new commit and return its id
    pub fn commit(&self) -> String {
        let id = fresh_id(0xa0);
        *self.head.lock() = Some(id.clone());
        id
    }

    pub fn checkout(&self, object: &str) {
        *self.head.lock() = Some(object.to_string());
    }

    pub fn attach_remote(&self, name: &str, remote: Arc<FakeRemote>) {
        *self.remote.lock() = Some((name.to_string(), remote));
    }

    pub fn tip(&self, note_ref: &NoteRef) -> Option<NotesCommit> {
        self.refs.lock().get(&note_ref.path()).cloned()
    }

    pub fn read_note_text(&self, namespace: Namespace, object: &str) -> Option<String> {
        self.read_note(&NoteRef::live(namespace), object)
            .expect("fake read cannot fail")
    }

    /// Overwrite a note bypassing the store, for corruption scenarios
    pub fn put_raw_note(&self, namespace: Namespace, object: &str, text: &str) {
        self.write_note(&NoteRef::live(namespace), object, text)
            .expect("fake write cannot fail");
    }

    fn remember(&self, text: &str) -> String {
        let id = blob_id(text);
        self.blobs.lock().insert(id.clone(), text.to_string());
        id
    }

    /// Commit a new text for one object on top of the ref's tip
    fn update<F>(&self, note_ref: &NoteRef, object: &str, f: F)
    where
        F: FnOnce(Option<&String>) -> String,
    {
        let mut refs = self.refs.lock();
        let parent = refs.get(&note_ref.path()).cloned().unwrap_or_default();
        let mut notes = parent.notes.clone();
        let text = f(notes.get(object));
        self.remember(&text);
        notes.insert(object.to_string(), text);
        refs.insert(note_ref.path(), parent.child(notes));
    }

    fn connected(&self, remote: &str) -> Result<Arc<FakeRemote>> {
        match &*self.remote.lock() {
            Some((name, r)) if name == remote => Ok(Arc::clone(r)),
            _ => Err(MemoryError::git(format!("no such remote {remote:?}"))),
        }
    }
}

impl NoteTransport for FakeTransport {
    fn head(&self) -> Result<String> {
        self.head
            .lock()
            .clone()
            .ok_or_else(|| MemoryError::repository("repository has no commits"))
    }

    fn git_dir(&self) -> Result<PathBuf> {
        Ok(self.git_dir.clone())
    }

    fn resolve_ref(&self, note_ref: &NoteRef) -> Result<Option<String>> {
        Ok(self.refs.lock().get(&note_ref.path()).map(|c| c.id.clone()))
    }

    fn read_note(&self, note_ref: &NoteRef, object: &str) -> Result<Option<String>> {
        Ok(self
            .refs
            .lock()
            .get(&note_ref.path())
            .and_then(|c| c.notes.get(object).cloned()))
    }

    fn append_ref(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()> {
        self.update(note_ref, object, |existing| match existing {
            Some(existing) => stored(&format!("{}\n\n{}", existing.trim_end(), text.trim_end())),
            None => stored(text),
        });
        Ok(())
    }

    fn write_note(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()> {
        self.update(note_ref, object, |_| stored(text));
        Ok(())
    }

    fn list_refs(&self, refs: &[NoteRef]) -> Result<BTreeMap<NoteRef, Vec<NoteAddr>>> {
        let mut out = BTreeMap::new();
        for note_ref in refs {
            let addrs: Vec<NoteAddr> = self
                .refs
                .lock()
                .get(&note_ref.path())
                .map(|c| {
                    c.notes
                        .iter()
                        .map(|(object, text)| NoteAddr {
                            object: object.clone(),
                            blob: blob_id(text),
                        })
                        .collect()
                })
                .unwrap_or_default();
            out.insert(*note_ref, addrs);
        }
        Ok(out)
    }

    fn read_blobs(&self, blobs: &[String]) -> Result<Vec<String>> {
        self.blob_reads.lock().push(blobs.len());
        let store = self.blobs.lock();
        blobs
            .iter()
            .map(|id| {
                store
                    .get(id)
                    .cloned()
                    .ok_or_else(|| MemoryError::git(format!("missing blob {id}")))
            })
            .collect()
    }

    fn has_remote(&self, remote: &str) -> Result<bool> {
        Ok(self.connected(remote).is_ok())
    }

    fn fetch_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<FetchStatus> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(MemoryError::git("fetch: connection refused"));
        }
        let remote = self.connected(remote)?;
        let theirs = remote.refs.lock().get(&note_ref.path()).cloned();
        match theirs {
            Some(commit) => {
                for text in commit.notes.values() {
                    self.remember(text);
                }
                self.refs
                    .lock()
                    .insert(note_ref.to_tracking().path(), commit);
                Ok(FetchStatus::Fetched)
            }
            None => Ok(FetchStatus::RemoteMissing),
        }
    }

    fn merge_refs(&self, local: &NoteRef, tracking: &NoteRef) -> Result<()> {
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(MemoryError::git("notes merge: simulated failure"));
        }
        let mut refs = self.refs.lock();
        let theirs = refs
            .get(&tracking.path())
            .cloned()
            .ok_or_else(|| MemoryError::git("nothing to merge"))?;
        let merged = match refs.get(&local.path()) {
            None => theirs,
            Some(ours) if ours.descends_from(&theirs) => return Ok(()),
            Some(ours) if theirs.descends_from(ours) => theirs,
            Some(ours) => {
                let mut notes = theirs.notes.clone();
                notes.extend(ours.notes.clone());
                let mut commit = ours.child(notes);
                commit.ancestors.insert(theirs.id.clone());
                commit.ancestors.extend(theirs.ancestors.iter().cloned());
                commit
            }
        };
        refs.insert(local.path(), merged);
        Ok(())
    }

    fn push_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<PushStatus> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(MemoryError::git("push: remote hung up"));
        }
        let remote = self.connected(remote)?;
        let Some(ours) = self.tip(note_ref) else {
            return Ok(PushStatus::NothingToPush);
        };
        let mut theirs = remote.refs.lock();
        if let Some(current) = theirs.get(&note_ref.path()) {
            if !ours.descends_from(current) {
                return Err(MemoryError::git("push rejected (non-fast-forward)"));
            }
        }
        theirs.insert(note_ref.path(), ours);
        Ok(PushStatus::Pushed)
    }

    fn config_values(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.config.lock().get(key).cloned().unwrap_or_default())
    }

    fn config_add(&self, key: &str, value: &str) -> Result<()> {
        self.config
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    fn config_remove(&self, key: &str, value: &str) -> Result<()> {
        if let Some(values) = self.config.lock().get_mut(key) {
            values.retain(|v| v != value);
        }
        Ok(())
    }
}

pub fn fast_lock() -> LockPolicy {
    LockPolicy {
        max_attempts: 50,
        base_delay_ms: 1,
        max_delay_ms: 20,
    }
}

/// Store over a fake transport; the lock file lives in `dir`
pub fn fake_store(domain: Domain, dir: &Path) -> (NoteStore, Arc<FakeTransport>) {
    let fake = Arc::new(FakeTransport::new(dir));
    let store = store_over(domain, dir, Arc::clone(&fake));
    (store, fake)
}

pub fn store_over(domain: Domain, dir: &Path, fake: Arc<FakeTransport>) -> NoteStore {
    NoteStore::new(domain, fake, RepoLock::for_git_dir(dir, fast_lock()))
}

pub fn at(second: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_790_000_000 + second, 0).unwrap()
}

pub fn entry(namespace: Namespace, summary: &str, second: i64) -> MemoryEntry {
    MemoryEntry::builder(namespace)
        .summary(summary)
        .content(format!("Details about {summary}."))
        .tag("test")
        .timestamp(at(second))
        .build()
        .unwrap()
}

// Real git

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// True (after saying so) when `git` is not installed and the test should return
pub fn skip_without_git() -> bool {
    if git_available() {
        false
    } else {
        eprintln!("git not found, skipping");
        true
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
}

/// Non-bare repository with one commit
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet"]);
    configure_identity(dir);
    git(dir, &["commit", "--quiet", "--allow-empty", "-m", "initial"]);
}

pub fn init_bare(dir: &Path) {
    git(dir, &["init", "--quiet", "--bare"]);
}

/// Clone `remote` into `dir`
pub fn clone_repo(remote: &Path, dir: &Path) {
    let parent = dir.parent().unwrap();
    let name = dir.file_name().unwrap().to_str().unwrap();
    git(
        parent,
        &["clone", "--quiet", remote.to_str().unwrap(), name],
    );
    configure_identity(dir);
}

/// Bare remote plus two clones sharing its first commit: `(remote, a, b)`
pub fn replicas(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let remote = root.join("remote.git");
    let seed = root.join("seed");
    let a = root.join("a");
    let b = root.join("b");
    for dir in [&remote, &seed] {
        std::fs::create_dir_all(dir).unwrap();
    }

    init_bare(&remote);
    git(&remote, &["symbolic-ref", "HEAD", "refs/heads/trunk"]);
    init_repo(&seed);
    git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
    git(&seed, &["push", "--quiet", "origin", "HEAD:refs/heads/trunk"]);

    clone_repo(&remote, &a);
    clone_repo(&remote, &b);
    (remote, a, b)
}

/// Service over a fake project store and an in-memory index
pub fn fake_service(
    dir: &Path,
    fake: Arc<FakeTransport>,
    embedder: Option<Arc<dyn gitmem_memory::EmbeddingProvider>>,
) -> gitmem_memory::MemoryService {
    let mut config = gitmem_memory::MemoryConfig::for_repo(dir);
    config.chunk_size = 4;
    gitmem_memory::MemoryService::new(
        store_over(Domain::Project, dir, fake),
        None,
        Arc::new(gitmem_memory::SecondaryIndex::in_memory().unwrap()),
        embedder,
        config,
    )
}
