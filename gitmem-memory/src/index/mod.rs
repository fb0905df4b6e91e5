//! SQLite secondary index
//!
//! A rebuildable projection of the note store: one row per memory plus
//! embedding and lifecycle columns. Git stays the source of truth; anything
//! here can be recreated with [`rebuild::repair`].

pub mod migration;
pub mod rebuild;
mod scratch;
pub mod search;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{MemoryError, Result};
use crate::lifecycle::{LifecycleScorer, Tier};
use crate::node::{Domain, Memory, MemoryId, MemoryStatus, Namespace};
use crate::note::format::REDACTED_BODY;

pub use rebuild::{DriftReport, RebuildResult};
pub use search::{SearchFilters, VectorHit};

/// Largest `IN (...)` list sent in one statement
const MAX_IN_PARAMS: usize = 500;

pub(crate) const SELECT_COLUMNS: &str = "id, summary, content, tags, created_at, status, spec, \
     relates_to, extra, indexed_at, embedding, tier, activation_count, last_accessed_at";

const UPSERT_SQL: &str = "INSERT INTO memories (
        id, domain, namespace, object, entry_key, summary, content, tags, created_at,
        status, spec, relates_to, extra, indexed_at, embedding, embedding_dim, tier
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
    ON CONFLICT(id) DO UPDATE SET
        summary = excluded.summary,
        content = excluded.content,
        tags = excluded.tags,
        created_at = excluded.created_at,
        status = excluded.status,
        spec = excluded.spec,
        relates_to = excluded.relates_to,
        extra = excluded.extra,
        indexed_at = excluded.indexed_at,
        embedding = CASE
            WHEN excluded.embedding IS NOT NULL THEN excluded.embedding
            WHEN memories.summary = excluded.summary AND memories.content = excluded.content
                THEN memories.embedding
            ELSE NULL END,
        embedding_dim = CASE
            WHEN excluded.embedding IS NOT NULL THEN excluded.embedding_dim
            WHEN memories.summary = excluded.summary AND memories.content = excluded.content
                THEN memories.embedding_dim
            ELSE NULL END";

/// One row of the index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecord {
    pub memory: Memory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub tier: Tier,
    pub activation_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexRecord {
    /// Fresh row for a memory
    pub fn new(memory: Memory) -> Self {
        Self {
            memory,
            embedding: None,
            tier: Tier::default(),
            activation_count: 0,
            last_accessed_at: None,
            indexed_at: Utc::now(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn id(&self) -> &MemoryId {
        &self.memory.id
    }
}

/// Row counts by dimension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub with_embedding: usize,
    pub schema_version: u32,
    pub by_domain: BTreeMap<String, usize>,
    pub by_namespace: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
}

/// SQLite-backed secondary index.
///
/// All access goes through one mutex-guarded connection; share the index
/// behind an `Arc`.
pub struct SecondaryIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    schema_version: u32,
}

impl SecondaryIndex {
    /// Open (or create) the index at `path` and migrate it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        let index = Self::initialize(conn, Some(path.to_path_buf()))?;
        log::info!(
            "Opened index at {} (schema v{})",
            path.display(),
            index.schema_version
        );
        Ok(index)
    }

    /// Open an in-memory index (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, None)
    }

    fn initialize(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        match Self::prepare(&mut conn) {
            Ok(schema_version) => Ok(Self {
                conn: Mutex::new(conn),
                path,
                schema_version,
            }),
            Err(e) => {
                if let Err((_, close_err)) = conn.close() {
                    log::warn!("Failed to close index after open error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn prepare(conn: &mut Connection) -> Result<u32> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(classify)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(classify)?;
        migration::migrate(conn).map_err(|e| match e {
            MemoryError::Sqlite(inner) => classify(inner),
            other => other,
        })
    }

    /// Database path (None for in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Re-run pending migrations; returns the resulting version
    pub fn migrate(&self) -> Result<u32> {
        let mut conn = self.conn.lock();
        migration::migrate(&mut conn)
    }

    pub fn upsert(&self, record: &IndexRecord) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(record))
    }

    /// Upsert many rows in one transaction
    pub fn upsert_batch(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for record in records {
                let m = &record.memory;
                let embedding = record
                    .embedding
                    .as_ref()
                    .map(bincode::serialize)
                    .transpose()?;
                stmt.execute(params![
                    m.id.to_string(),
                    m.id.domain.as_str(),
                    m.id.namespace.as_str(),
                    m.id.object,
                    m.id.key,
                    m.summary,
                    m.content,
                    serde_json::to_string(&m.tags)?,
                    m.created_at.timestamp(),
                    m.status.as_str(),
                    m.spec,
                    serde_json::to_string(&m.relates_to)?,
                    serde_json::to_string(&m.extra)?,
                    record.indexed_at.timestamp(),
                    embedding,
                    record.embedding.as_ref().map(|e| e.len() as i64),
                    record.tier.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &MemoryId) -> Result<Option<IndexRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1");
        Ok(conn
            .query_row(&sql, [id.to_string()], read_record)
            .optional()?)
    }

    /// Rows for `ids`, in the order given; unknown ids are skipped
    pub fn get_many(&self, ids: &[MemoryId]) -> Result<Vec<IndexRecord>> {
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut found = self.get_by_keys(&keys)?;
        Ok(keys.iter().filter_map(|k| found.remove(k)).collect())
    }

    pub(crate) fn get_by_keys(
        &self,
        keys: &[String],
    ) -> Result<std::collections::HashMap<String, IndexRecord>> {
        let conn = self.conn.lock();
        let mut found = std::collections::HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_IN_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql =
                format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), read_record)?;
            for row in rows {
                let record = row?;
                found.insert(record.memory.id.to_string(), record);
            }
        }
        Ok(found)
    }

    /// Newest rows first, optionally within one namespace
    pub fn list_recent(&self, namespace: Option<Namespace>, limit: usize) -> Result<Vec<IndexRecord>> {
        let conn = self.conn.lock();
        let limit = limit.min(search::MAX_RESULTS) as i64;
        let records = match namespace {
            Some(ns) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM memories WHERE namespace = ?1
                     ORDER BY created_at DESC, id LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![ns.as_str(), limit], read_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM memories ORDER BY created_at DESC, id LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([limit], read_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// Set the status of one row; false when the row does not exist
    pub fn update_status(&self, id: &MemoryId, status: MemoryStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let tier_sql = match status {
            MemoryStatus::Archived | MemoryStatus::Tombstoned => ", tier = 'archived'",
            _ => "",
        };
        let sql = format!("UPDATE memories SET status = ?1{tier_sql} WHERE id = ?2");
        let changed = conn.execute(&sql, params![status.as_str(), id.to_string()])?;
        Ok(changed > 0)
    }

    /// Replace content with the redaction marker and drop the embedding
    pub fn redact(&self, id: &MemoryId) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE memories SET content = ?1, embedding = NULL, embedding_dim = NULL WHERE id = ?2",
            params![REDACTED_BODY, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Count one retrieval of each id
    pub fn record_access(&self, ids: &[MemoryId], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE memories SET activation_count = activation_count + 1,
                 last_accessed_at = ?1 WHERE id = ?2",
            )?;
            for id in ids {
                updated += stmt.execute(params![at.timestamp(), id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Up to `limit` ids of rows without an embedding, in id order, starting
    /// after `after`
    pub fn ids_missing_embedding(
        &self,
        domain: Option<Domain>,
        after: Option<&MemoryId>,
        limit: usize,
    ) -> Result<Vec<MemoryId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM memories
             WHERE embedding IS NULL AND (?1 IS NULL OR domain = ?1) AND id > ?2
             ORDER BY id LIMIT ?3",
        )?;
        let after = after.map_or_else(String::new, ToString::to_string);
        let limit = limit.min(search::MAX_RESULTS) as i64;
        let rows = stmt.query_map(params![domain.map(|d| d.as_str()), after, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?.parse()?);
        }
        Ok(ids)
    }

    /// First `limit` rows without an embedding, in id order
    pub fn records_missing_embedding(
        &self,
        domain: Option<Domain>,
        limit: usize,
    ) -> Result<Vec<IndexRecord>> {
        let ids = self.ids_missing_embedding(domain, None, limit)?;
        self.get_many(&ids)
    }

    pub fn set_embedding(&self, id: &MemoryId, embedding: &[f32]) -> Result<bool> {
        let blob = bincode::serialize(embedding)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE memories SET embedding = ?1, embedding_dim = ?2 WHERE id = ?3",
            params![blob, embedding.len() as i64, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Recompute every row's tier; returns the number of rows that moved
    pub fn refresh_tiers(&self, scorer: &LifecycleScorer, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut moved = 0;
        {
            let mut select =
                tx.prepare("SELECT id, created_at, status, activation_count, tier FROM memories")?;
            let rows = select
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut update = tx.prepare_cached("UPDATE memories SET tier = ?1 WHERE id = ?2")?;
            for (id, created_at, status, activation_count, tier) in rows {
                let created_at = timestamp_from_secs(created_at)?;
                let status: MemoryStatus = status.parse()?;
                let score = scorer.score_parts(created_at, status, activation_count, now);
                if score.tier.as_str() != tier {
                    update.execute(params![score.tier.as_str(), id])?;
                    moved += 1;
                }
            }
        }
        tx.commit()?;
        if moved > 0 {
            log::debug!("Moved {} memories between tiers", moved);
        }
        Ok(moved)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.conn.lock();
        let mut stats = IndexStats {
            schema_version: migration::current_version(&conn)?,
            ..IndexStats::default()
        };
        let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, i64>(0));
        stats.total = count("SELECT COUNT(*) FROM memories")? as usize;
        stats.with_embedding =
            count("SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL")? as usize;
        for (column, target) in [
            ("domain", &mut stats.by_domain),
            ("namespace", &mut stats.by_namespace),
            ("status", &mut stats.by_status),
            ("tier", &mut stats.by_tier),
        ] {
            let sql = format!("SELECT {column}, COUNT(*) FROM memories GROUP BY {column}");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (key, n) = row?;
                target.insert(key, n as usize);
            }
        }
        Ok(stats)
    }

    /// Delete every row of a domain; returns the number removed
    pub fn delete_domain(&self, domain: Domain) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM memories WHERE domain = ?1", [domain.as_str()])?)
    }

    pub fn delete_ids(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM memories WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Map "this file is not a usable database" to [`MemoryError::IndexCorruption`]
fn classify(err: rusqlite::Error) -> MemoryError {
    match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
            MemoryError::corruption(err.to_string())
        }
        _ => MemoryError::Sqlite(err),
    }
}

pub(crate) fn timestamp_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| MemoryError::corruption(format!("timestamp out of range: {secs}")))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = MemoryError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    timestamp_from_secs(secs).map_err(|e| conversion_error(idx, e))
}

/// Row mapper for [`SELECT_COLUMNS`]
pub(crate) fn read_record(row: &Row<'_>) -> rusqlite::Result<IndexRecord> {
    let embedding = row
        .get::<_, Option<Vec<u8>>>(10)?
        .map(|blob| bincode::deserialize::<Vec<f32>>(&blob))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;
    let last_accessed_at = row
        .get::<_, Option<i64>>(13)?
        .map(timestamp_from_secs)
        .transpose()
        .map_err(|e| conversion_error(13, e))?;

    Ok(IndexRecord {
        memory: Memory {
            id: parsed_column(row, 0)?,
            summary: row.get(1)?,
            content: row.get(2)?,
            tags: json_column(row, 3)?,
            created_at: time_column(row, 4)?,
            status: parsed_column(row, 5)?,
            spec: row.get(6)?,
            relates_to: json_column(row, 7)?,
            extra: json_column(row, 8)?,
        },
        indexed_at: time_column(row, 9)?,
        embedding,
        tier: parsed_column(row, 11)?,
        activation_count: row.get(12)?,
        last_accessed_at,
    })
}
