//! Per-namespace sync results

use serde::Serialize;

use crate::error::{MemoryError, SyncPhase};
use crate::node::Namespace;

/// Where a namespace ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Fetched,
    Merged,
    Pushed,
    FetchFailed,
    MergeFailed,
    PushFailed,
}

impl SyncState {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed | Self::MergeFailed | Self::PushFailed
        )
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum PhaseOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

impl PhaseOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Sync result for one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSync {
    pub namespace: Namespace,
    pub state: SyncState,
    pub fetch: PhaseOutcome,
    pub merge: PhaseOutcome,
    pub push: PhaseOutcome,
    /// Notes rewritten with the entry-level union
    pub rewritten_notes: usize,
    /// The local ref tip moved
    pub changed: bool,
}

impl NamespaceSync {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            state: SyncState::Pending,
            fetch: PhaseOutcome::skipped("not started"),
            merge: PhaseOutcome::skipped("not started"),
            push: PhaseOutcome::skipped("not started"),
            rewritten_notes: 0,
            changed: false,
        }
    }

    /// The failed phase as an error, if any
    pub fn error(&self) -> Option<MemoryError> {
        [
            (SyncPhase::Fetch, &self.fetch),
            (SyncPhase::Merge, &self.merge),
            (SyncPhase::Push, &self.push),
        ]
        .into_iter()
        .find_map(|(phase, outcome)| match outcome {
            PhaseOutcome::Failed(reason) => Some(MemoryError::sync_phase(
                self.namespace.as_str(),
                phase,
                reason.clone(),
            )),
            _ => None,
        })
    }
}

/// Sync result for a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub remote: String,
    pub namespaces: Vec<NamespaceSync>,
}

impl SyncReport {
    /// Namespaces whose local ref moved
    pub fn changed(&self) -> Vec<Namespace> {
        self.namespaces
            .iter()
            .filter(|n| n.changed)
            .map(|n| n.namespace)
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &NamespaceSync> {
        self.namespaces.iter().filter(|n| n.state.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// First failure of the run as an error
    pub fn first_error(&self) -> Option<MemoryError> {
        self.failures().find_map(NamespaceSync::error)
    }
}
