//! Connection-local scratch tables for streaming passes over the store
//!
//! Rebuild and verify walk the store in chunks. What they have seen so far
//! (memory ids and status transitions) is recorded in `TEMP` tables next to
//! the index rather than in process memory, and orphans, replayed statuses
//! and drift are then settled with set-based SQL.

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use crate::error::Result;
use crate::index::SecondaryIndex;
use crate::node::{Domain, Memory, MemoryStatus, Namespace};
use crate::note::format::REDACTED_BODY;
use crate::note::StatusChange;

static NEXT_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Scratch tables of one pass, dropped with it
pub(crate) struct Scratch<'a> {
    index: &'a SecondaryIndex,
    seen: String,
    changes: String,
}

impl SecondaryIndex {
    pub(crate) fn scratch(&self) -> Result<Scratch<'_>> {
        let n = NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed);
        let scratch = Scratch {
            index: self,
            seen: format!("scratch_seen_{n}"),
            changes: format!("scratch_changes_{n}"),
        };
        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TEMP TABLE {seen} (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    content_differs INTEGER NOT NULL DEFAULT 0
                );
                CREATE TEMP TABLE {changes} (
                    id TEXT PRIMARY KEY,
                    target TEXT NOT NULL,
                    status TEXT NOT NULL,
                    redact INTEGER NOT NULL,
                    at INTEGER NOT NULL
                );
                CREATE INDEX temp.{changes}_target ON {changes}(target, at, id);",
                seen = scratch.seen,
                changes = scratch.changes,
            ))?;
            Ok(())
        })?;
        Ok(scratch)
    }
}

impl Scratch<'_> {
    /// Remember memories read from the store, with the status their entry declares
    pub fn record_seen<'m>(&self, memories: impl IntoIterator<Item = &'m Memory>) -> Result<()> {
        let sql = format!("INSERT OR IGNORE INTO {} (id, status) VALUES (?1, ?2)", self.seen);
        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            for memory in memories {
                stmt.execute(params![memory.id.to_string(), memory.status.as_str()])?;
            }
            Ok(())
        })
    }

    /// Flag seen memories whose indexed content differs from the note
    pub fn mark_content_differs(&self, ids: &[String]) -> Result<()> {
        let sql = format!("UPDATE {} SET content_differs = 1 WHERE id = ?1", self.seen);
        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            for id in ids {
                stmt.execute([id])?;
            }
            Ok(())
        })
    }

    pub fn record_changes(&self, changes: &[StatusChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, target, status, redact, at) VALUES (?1, ?2, ?3, ?4, ?5)",
            self.changes
        );
        self.in_transaction(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            for change in changes {
                stmt.execute(params![
                    change.id.to_string(),
                    change.target.to_string(),
                    change.status.as_str(),
                    change.redact,
                    change.at.timestamp(),
                ])?;
            }
            Ok(())
        })
    }

    /// Index rows of `domain` never seen
    pub fn unseen(&self, domain: Domain) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT id FROM memories
             WHERE domain = ?1 AND id NOT IN (SELECT id FROM {})
             ORDER BY id",
            self.seen
        );
        self.index.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([domain.as_str()], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Delete the rows [`unseen`](Self::unseen) would list, limited to `namespaces`
    pub fn delete_unseen(&self, domain: Domain, namespaces: &[Namespace]) -> Result<usize> {
        let mut values = vec![Value::Text(domain.as_str().to_string())];
        let mut namespace_sql = String::new();
        if !namespaces.is_empty() {
            let placeholders = vec!["?"; namespaces.len()].join(", ");
            namespace_sql = format!(" AND namespace IN ({placeholders})");
            values.extend(namespaces.iter().map(|n| Value::Text(n.as_str().to_string())));
        }
        let sql = format!(
            "DELETE FROM memories
             WHERE domain = ?{namespace_sql} AND id NOT IN (SELECT id FROM {})",
            self.seen
        );
        self.index
            .with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(values.iter()))?))
    }

    /// Apply the recorded transitions: the latest by `(at, id)` sets the
    /// status, and any redacting transition redacts. Returns how many
    /// transitions target an existing row.
    pub fn apply_changes(&self) -> Result<usize> {
        let changes = &self.changes;
        let sql = format!(
            "UPDATE memories SET status = (
                SELECT c.status FROM {changes} c WHERE c.target = memories.id
                ORDER BY c.at DESC, c.id DESC LIMIT 1
             )
             WHERE id IN (SELECT target FROM {changes});
             UPDATE memories SET tier = 'archived'
             WHERE id IN (SELECT target FROM {changes})
               AND status IN ('{archived}', '{tombstoned}');",
            archived = MemoryStatus::Archived.as_str(),
            tombstoned = MemoryStatus::Tombstoned.as_str(),
        );
        let redact_sql = format!(
            "UPDATE memories SET content = ?1, embedding = NULL, embedding_dim = NULL
             WHERE id IN (SELECT target FROM {changes} WHERE redact = 1)"
        );
        let count_sql = format!(
            "SELECT
                (SELECT COUNT(*) FROM {changes} WHERE target IN (SELECT id FROM memories)),
                (SELECT COUNT(*) FROM {changes})"
        );

        self.in_transaction(|conn| {
            conn.execute_batch(&sql)?;
            conn.execute(&redact_sql, [REDACTED_BODY])?;
            let (applied, total): (i64, i64) =
                conn.query_row(&count_sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
            if applied < total {
                log::debug!("{} status changes target unknown memories", total - applied);
            }
            Ok(applied as usize)
        })
    }

    /// Seen rows whose indexed status differs from the replayed store status
    pub fn status_drift(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT s.id FROM {seen} s JOIN memories m ON m.id = s.id
             WHERE m.status != COALESCE(
                (SELECT c.status FROM {changes} c WHERE c.target = s.id
                 ORDER BY c.at DESC, c.id DESC LIMIT 1),
                s.status)
             ORDER BY s.id",
            seen = self.seen,
            changes = self.changes,
        );
        self.query_ids(&sql, &[])
    }

    /// Rows flagged by [`mark_content_differs`](Self::mark_content_differs),
    /// except those a redacting transition accounts for
    pub fn content_drift(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT s.id FROM {seen} s JOIN memories m ON m.id = s.id
             WHERE s.content_differs = 1
               AND NOT (m.content = ?1 AND EXISTS (
                   SELECT 1 FROM {changes} c WHERE c.target = s.id AND c.redact = 1))
             ORDER BY s.id",
            seen = self.seen,
            changes = self.changes,
        );
        self.query_ids(&sql, &[Value::Text(REDACTED_BODY.to_string())])
    }

    fn query_ids(&self, sql: &str, values: &[Value]) -> Result<Vec<String>> {
        self.index.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
    }

    fn in_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.index.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        let sql = format!(
            "DROP TABLE IF EXISTS temp.{}; DROP TABLE IF EXISTS temp.{};",
            self.seen, self.changes
        );
        if let Err(e) = self.index.with_conn(|conn| Ok(conn.execute_batch(&sql)?)) {
            log::warn!("Failed to drop scratch tables: {}", e);
        }
    }
}
