//! Notes ref naming
//!
//! Live refs are `refs/notes/mem/<namespace>`. Remote state is fetched into
//! tracking refs `refs/notes/mem/origin/<namespace>` and never written
//! straight into a live ref.

use crate::error::{MemoryError, Result};
use crate::node::Namespace;

/// Root of every ref this crate owns
pub const NOTES_ROOT: &str = "refs/notes/mem";

/// Segment under [`NOTES_ROOT`] that holds tracking refs
pub const TRACKING_SEGMENT: &str = "origin";

/// Fetch refspec installed in `remote.<name>.fetch`
pub const TRACKING_FETCH_GLOB: &str = "+refs/notes/mem/*:refs/notes/mem/origin/*";

/// Fetch refspec written by older versions; fetches straight into live refs
pub const LEGACY_FETCH_GLOB: &str = "refs/notes/mem/*:refs/notes/mem/*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    Live,
    Tracking,
}

/// A notes ref for one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteRef {
    namespace: Namespace,
    kind: RefKind,
}

impl NoteRef {
    pub fn live(namespace: Namespace) -> Self {
        Self {
            namespace,
            kind: RefKind::Live,
        }
    }

    pub fn tracking(namespace: Namespace) -> Self {
        Self {
            namespace,
            kind: RefKind::Tracking,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    /// The tracking ref paired with this ref's namespace
    pub fn to_tracking(&self) -> Self {
        Self::tracking(self.namespace)
    }

    /// Full ref path
    pub fn path(&self) -> String {
        match self.kind {
            RefKind::Live => format!("{NOTES_ROOT}/{}", self.namespace),
            RefKind::Tracking => format!("{NOTES_ROOT}/{TRACKING_SEGMENT}/{}", self.namespace),
        }
    }

    /// Forced refspec that fetches the remote live ref into the local tracking ref
    pub fn fetch_refspec(&self) -> String {
        format!("+{}:{}", Self::live(self.namespace).path(), self.to_tracking().path())
    }

    /// Non-forced refspec that pushes the local live ref to the remote live ref
    pub fn push_refspec(&self) -> String {
        let live = Self::live(self.namespace).path();
        format!("{live}:{live}")
    }
}

impl std::fmt::Display for NoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// Whether a configured fetch refspec is the legacy live-ref glob
pub fn is_legacy_fetch_refspec(value: &str) -> bool {
    let value = value.trim();
    value.strip_prefix('+').unwrap_or(value) == LEGACY_FETCH_GLOB
}

/// Reject remote names that git would read as options or paths
pub fn validate_remote_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.contains("..")
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(MemoryError::validation(format!("invalid remote name: {name:?}")))
    }
}
