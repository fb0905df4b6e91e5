//! [`NoteTransport`] over the `git` CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{MemoryError, Result};
use crate::git::{
    CatFileSession, FetchStatus, GitExecutor, NoteAddr, NoteTransport, PushStatus, RawNote,
};
use crate::note::NoteRef;
use crate::note::refs::validate_remote_name;

const NO_NOTE_FOUND: &str = "no note found";
const REMOTE_REF_MISSING: &str = "couldn't find remote ref";

#[derive(Debug, Clone)]
pub struct GitTransport {
    git: GitExecutor,
}

impl GitTransport {
    /// Use an existing repository
    pub fn open(repo_path: &Path) -> Result<Self> {
        Ok(Self {
            git: GitExecutor::new(repo_path)?,
        })
    }

    /// Use the repository at `path`, creating it with an empty root commit
    /// if needed
    pub fn open_or_init(repo_path: &Path) -> Result<Self> {
        Ok(Self {
            git: GitExecutor::open_or_init(repo_path)?,
        })
    }

    pub fn executor(&self) -> &GitExecutor {
        &self.git
    }

    fn session(&self) -> Result<CatFileSession> {
        CatFileSession::start(&self.git)
    }
}

impl NoteTransport for GitTransport {
    fn head(&self) -> Result<String> {
        let output = self
            .git
            .output(&["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])?;
        if !output.status.success() {
            return Err(MemoryError::repository(format!(
                "repository at {} has no commits",
                self.git.repo_path().display()
            )));
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    fn git_dir(&self) -> Result<PathBuf> {
        let dir = self.git.run(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(dir.trim()))
    }

    fn resolve_ref(&self, note_ref: &NoteRef) -> Result<Option<String>> {
        let path = note_ref.path();
        let output = self
            .git
            .output(&["rev-parse", "--verify", "--quiet", &path])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8(output.stdout)?.trim().to_string()))
    }

    fn read_note(&self, note_ref: &NoteRef, object: &str) -> Result<Option<String>> {
        let path = note_ref.path();
        let output = self.git.output(&["notes", "--ref", &path, "show", object])?;
        if output.status.success() {
            return Ok(Some(String::from_utf8(output.stdout)?));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(NO_NOTE_FOUND) {
            Ok(None)
        } else {
            Err(MemoryError::git(format!("git notes show: {}", stderr.trim())))
        }
    }

    fn append_ref(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()> {
        let path = note_ref.path();
        self.git.run_with_input(
            &["notes", "--ref", &path, "append", "-F", "-", object],
            text,
        )?;
        Ok(())
    }

    fn write_note(&self, note_ref: &NoteRef, object: &str, text: &str) -> Result<()> {
        let path = note_ref.path();
        self.git.run_with_input(
            &["notes", "--ref", &path, "add", "-f", "-F", "-", object],
            text,
        )?;
        Ok(())
    }

    fn list_refs(&self, refs: &[NoteRef]) -> Result<BTreeMap<NoteRef, Vec<NoteAddr>>> {
        let mut session = self.session()?;
        let mut listing = BTreeMap::new();
        for note_ref in refs {
            listing.insert(*note_ref, session.list_notes(&note_ref.path())?);
        }
        Ok(listing)
    }

    fn read_blobs(&self, blobs: &[String]) -> Result<Vec<String>> {
        if blobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut session = self.session()?;
        blobs.iter().map(|oid| session.read_blob(oid)).collect()
    }

    fn read_refs(&self, refs: &[NoteRef]) -> Result<BTreeMap<NoteRef, Vec<RawNote>>> {
        let mut session = self.session()?;
        let mut notes = BTreeMap::new();
        for note_ref in refs {
            let addrs = session.list_notes(&note_ref.path())?;
            let mut raw = Vec::with_capacity(addrs.len());
            for addr in addrs {
                raw.push(RawNote {
                    text: session.read_blob(&addr.blob)?,
                    object: addr.object,
                });
            }
            notes.insert(*note_ref, raw);
        }
        Ok(notes)
    }

    fn has_remote(&self, remote: &str) -> Result<bool> {
        validate_remote_name(remote)?;
        let remotes = self.git.run(&["remote"])?;
        Ok(remotes.lines().any(|r| r.trim() == remote))
    }

    fn fetch_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<FetchStatus> {
        validate_remote_name(remote)?;
        let refspec = note_ref.fetch_refspec();
        let output = self
            .git
            .output(&["fetch", "--quiet", "--no-tags", remote, &refspec])?;
        if output.status.success() {
            return Ok(FetchStatus::Fetched);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(REMOTE_REF_MISSING) {
            Ok(FetchStatus::RemoteMissing)
        } else {
            Err(MemoryError::git(format!("git fetch: {}", stderr.trim())))
        }
    }

    fn merge_refs(&self, local: &NoteRef, tracking: &NoteRef) -> Result<()> {
        let local = local.path();
        let tracking = tracking.path();
        self.git.run(&[
            "notes",
            "--ref",
            &local,
            "merge",
            "--quiet",
            "--strategy=ours",
            &tracking,
        ])?;
        Ok(())
    }

    fn push_ref(&self, remote: &str, note_ref: &NoteRef) -> Result<PushStatus> {
        validate_remote_name(remote)?;
        if self.resolve_ref(note_ref)?.is_none() {
            return Ok(PushStatus::NothingToPush);
        }
        let refspec = note_ref.push_refspec();
        self.git.run(&["push", "--quiet", remote, &refspec])?;
        Ok(PushStatus::Pushed)
    }

    fn config_values(&self, key: &str) -> Result<Vec<String>> {
        let output = self.git.output(&["config", "--get-all", key])?;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8(output.stdout)?
                .lines()
                .map(str::to_string)
                .collect()),
            // Key not set
            Some(1) => Ok(Vec::new()),
            _ => Err(MemoryError::git(format!(
                "git config --get-all {key}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    fn config_add(&self, key: &str, value: &str) -> Result<()> {
        self.git.run(&["config", "--add", key, value])?;
        Ok(())
    }

    fn config_remove(&self, key: &str, value: &str) -> Result<()> {
        let pattern = format!("^{}$", regex::escape(value));
        self.git.run(&["config", "--unset-all", key, &pattern])?;
        Ok(())
    }
}
