//! Fetch, merge and push of notes refs
//!
//! For each namespace:
//!
//! 1. fetch the remote live ref into the local tracking ref (forced, so the
//!    tracking ref always mirrors the remote),
//! 2. merge the tracking ref into the live ref keeping local notes, then
//!    rewrite every note that differed on the two sides with the union of
//!    their entries,
//! 3. push the live ref without force.
//!
//! A failed phase stops that namespace only. Merged local state is kept even
//! when the push is rejected; the next run pushes it.

pub mod merge;
pub mod outcome;
pub mod refspec;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::git::{FetchStatus, NoteTransport, PushStatus};
use crate::node::Namespace;
use crate::note::refs::validate_remote_name;
use crate::note::NoteRef;

pub use merge::merge_note_texts;
pub use outcome::{NamespaceSync, PhaseOutcome, SyncReport, SyncState};
pub use refspec::{migrate_fetch_config, RefspecMigration};

pub struct SyncEngine {
    transport: Arc<dyn NoteTransport>,
    remote: String,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn NoteTransport>, remote: impl Into<String>) -> Result<Self> {
        let remote = remote.into();
        validate_remote_name(&remote)?;
        Ok(Self { transport, remote })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Sync every namespace in turn
    pub fn run(&self, namespaces: &[Namespace]) -> Result<SyncReport> {
        if !self.transport.has_remote(&self.remote)? {
            return Err(MemoryError::repository(format!(
                "no remote named {:?}",
                self.remote
            )));
        }

        let mut report = SyncReport {
            remote: self.remote.clone(),
            namespaces: Vec::with_capacity(namespaces.len()),
        };
        for &namespace in namespaces {
            let result = self.sync_namespace(namespace);
            match result.state {
                s if s.is_failure() => log::warn!("Sync of {} ended in {:?}", namespace, s),
                s => log::debug!("Sync of {} ended in {:?}", namespace, s),
            }
            report.namespaces.push(result);
        }
        Ok(report)
    }

    fn sync_namespace(&self, namespace: Namespace) -> NamespaceSync {
        let live = NoteRef::live(namespace);
        let tracking = live.to_tracking();
        let mut out = NamespaceSync::new(namespace);
        let before = self.transport.resolve_ref(&live).ok().flatten();

        // Fetch
        let remote_present = match self.transport.fetch_ref(&self.remote, &live) {
            Ok(status) => {
                out.fetch = PhaseOutcome::Succeeded;
                out.state = SyncState::Fetched;
                status == FetchStatus::Fetched
            }
            Err(e) => {
                out.fetch = PhaseOutcome::failed(&e);
                out.merge = PhaseOutcome::skipped("fetch failed");
                out.push = PhaseOutcome::skipped("fetch failed");
                out.state = SyncState::FetchFailed;
                return out;
            }
        };

        // Merge
        if remote_present {
            match self.merge(&live, &tracking) {
                Ok(Some(rewritten)) => {
                    out.merge = PhaseOutcome::Succeeded;
                    out.rewritten_notes = rewritten;
                    out.state = SyncState::Merged;
                }
                Ok(None) => {
                    out.merge = PhaseOutcome::skipped("already up to date");
                    out.state = SyncState::Merged;
                }
                Err(e) => {
                    out.merge = PhaseOutcome::failed(&e);
                    out.push = PhaseOutcome::skipped("merge failed");
                    out.state = SyncState::MergeFailed;
                    out.changed = self.moved(&live, &before);
                    return out;
                }
            }
        } else {
            out.merge = PhaseOutcome::skipped("remote ref does not exist");
        }

        // Push
        match self.transport.push_ref(&self.remote, &live) {
            Ok(PushStatus::Pushed) => {
                out.push = PhaseOutcome::Succeeded;
                out.state = SyncState::Pushed;
            }
            Ok(PushStatus::NothingToPush) => {
                out.push = PhaseOutcome::skipped("no local notes");
            }
            Err(e) => {
                out.push = PhaseOutcome::failed(&e);
                out.state = SyncState::PushFailed;
            }
        }

        out.changed = self.moved(&live, &before);
        out
    }

    fn moved(&self, live: &NoteRef, before: &Option<String>) -> bool {
        match self.transport.resolve_ref(live) {
            Ok(after) => after != *before,
            // Unknown; reindexing is the safe answer
            Err(_) => true,
        }
    }

    /// Merge `tracking` into `live`. `None` when both already point at the
    /// same commit; otherwise the number of notes rewritten.
    fn merge(&self, live: &NoteRef, tracking: &NoteRef) -> Result<Option<usize>> {
        let local_tip = self.transport.resolve_ref(live)?;
        let remote_tip = self.transport.resolve_ref(tracking)?;
        if remote_tip.is_none() || local_tip == remote_tip {
            return Ok(None);
        }

        let mut listing = self.transport.list_refs(&[*live, *tracking])?;
        let local: BTreeMap<String, String> = listing
            .remove(live)
            .unwrap_or_default()
            .into_iter()
            .map(|a| (a.object, a.blob))
            .collect();
        let remote = listing.remove(tracking).unwrap_or_default();

        // Objects annotated on both sides with different text
        let conflicts: Vec<(String, String, String)> = remote
            .into_iter()
            .filter_map(|addr| match local.get(&addr.object) {
                Some(local_blob) if *local_blob != addr.blob => {
                    Some((addr.object, local_blob.clone(), addr.blob))
                }
                _ => None,
            })
            .collect();

        self.transport.merge_refs(live, tracking)?;
        if conflicts.is_empty() {
            return Ok(Some(0));
        }

        // What the merge left on each conflicting object
        let merged_blobs: BTreeMap<String, String> = self
            .transport
            .list_refs(&[*live])?
            .remove(live)
            .unwrap_or_default()
            .into_iter()
            .map(|a| (a.object, a.blob))
            .collect();

        let blobs: Vec<String> = conflicts
            .iter()
            .flat_map(|(object, l, r)| {
                let current = merged_blobs.get(object).unwrap_or(l);
                [l.clone(), r.clone(), current.clone()]
            })
            .collect();
        let texts = self.transport.read_blobs(&blobs)?;

        let mut rewritten = 0;
        for ((object, _, _), triple) in conflicts.iter().zip(texts.chunks(3)) {
            let [local_text, remote_text, current_text] = triple else {
                return Err(MemoryError::git("short read while merging notes"));
            };
            let merged = merge_note_texts(local_text, remote_text);
            // Rewriting identical text would still create a notes commit
            if merged != *current_text {
                self.transport.write_note(live, object, &merged)?;
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            log::info!(
                "Merged {}: {} notes combined entry by entry",
                live,
                rewritten
            );
        }
        Ok(Some(rewritten))
    }
}
