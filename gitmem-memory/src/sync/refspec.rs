//! Migration of legacy fetch refspecs
//!
//! Older configurations fetched `refs/notes/mem/*` straight onto the live
//! refs, which lets a fetch clobber unpushed local notes. They are replaced
//! with the tracking-ref glob.

use serde::Serialize;

use crate::error::Result;
use crate::git::NoteTransport;
use crate::note::refs::{is_legacy_fetch_refspec, validate_remote_name, TRACKING_FETCH_GLOB};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefspecMigration {
    pub removed: Vec<String>,
    pub added: bool,
}

impl RefspecMigration {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && !self.added
    }
}

/// Replace legacy `remote.<remote>.fetch` values; a no-op when none exist
pub fn migrate_fetch_config(transport: &dyn NoteTransport, remote: &str) -> Result<RefspecMigration> {
    validate_remote_name(remote)?;
    let key = format!("remote.{remote}.fetch");
    let values = transport.config_values(&key)?;

    let mut legacy: Vec<String> = values
        .iter()
        .filter(|v| is_legacy_fetch_refspec(v))
        .cloned()
        .collect();
    legacy.dedup();
    if legacy.is_empty() {
        return Ok(RefspecMigration::default());
    }

    for value in &legacy {
        transport.config_remove(&key, value)?;
    }

    let has_tracking = values.iter().any(|v| v.trim() == TRACKING_FETCH_GLOB);
    if !has_tracking {
        transport.config_add(&key, TRACKING_FETCH_GLOB)?;
    }

    log::info!(
        "Migrated {}: removed {} legacy refspec(s)",
        key,
        legacy.len()
    );
    Ok(RefspecMigration {
        removed: legacy,
        added: !has_tracking,
    })
}
