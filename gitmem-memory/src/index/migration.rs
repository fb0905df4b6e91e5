//! Index schema migrations
//!
//! The schema version lives in a single-row `schema_version` table. Each
//! migration runs in its own transaction together with the version bump, so
//! a failure leaves the database at the previous version.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{MemoryError, Result};

/// Newest schema this build understands
pub const CURRENT_VERSION: u32 = 3;

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
)";

/// `(version, sql)` in application order
const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        "CREATE TABLE memories (
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            namespace TEXT NOT NULL,
            object TEXT NOT NULL,
            entry_key TEXT NOT NULL,
            summary TEXT NOT NULL,
            content TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            spec TEXT,
            relates_to TEXT NOT NULL DEFAULT '[]',
            extra TEXT NOT NULL DEFAULT '[]',
            indexed_at INTEGER NOT NULL
        );
        CREATE INDEX idx_memories_namespace_created ON memories(namespace, created_at DESC);",
    ),
    (
        2,
        "ALTER TABLE memories ADD COLUMN embedding BLOB;
        ALTER TABLE memories ADD COLUMN embedding_dim INTEGER;",
    ),
    (
        3,
        "ALTER TABLE memories ADD COLUMN tier TEXT NOT NULL DEFAULT 'hot';
        ALTER TABLE memories ADD COLUMN activation_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE memories ADD COLUMN last_accessed_at INTEGER;
        CREATE INDEX idx_memories_domain_status ON memories(domain, status);",
    ),
];

/// Columns the current schema must have
pub const EXPECTED_COLUMNS: &[&str] = &[
    "id",
    "domain",
    "namespace",
    "object",
    "entry_key",
    "summary",
    "content",
    "tags",
    "created_at",
    "status",
    "spec",
    "relates_to",
    "extra",
    "indexed_at",
    "embedding",
    "embedding_dim",
    "tier",
    "activation_count",
    "last_accessed_at",
];

/// Version recorded in the database, 0 for a fresh one
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.execute(VERSION_TABLE, [])?;
    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Apply every pending migration; returns the resulting version
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let from = current_version(conn)?;
    if from > CURRENT_VERSION {
        return Err(MemoryError::corruption(format!(
            "index schema v{from} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if from < CURRENT_VERSION {
        log::info!(
            "Index schema version: {} (current: {})",
            from,
            CURRENT_VERSION
        );
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > from) {
        log::debug!("Applying index migration v{}", version);
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [version],
        )?;
        tx.commit()?;
    }

    check_columns(conn)?;
    Ok(CURRENT_VERSION)
}

/// Fail with [`MemoryError::IndexCorruption`] when a column is missing
pub fn check_columns(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('memories')")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let missing: Vec<&str> = EXPECTED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MemoryError::corruption(format!(
            "memories table is missing columns: {}",
            missing.join(", ")
        )))
    }
}
