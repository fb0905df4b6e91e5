//! Filtered vector and substring search over the index
//!
//! Filters are applied in SQL first; vector distances are then computed
//! only over the filtered candidates and the top `k` kept in a bounded
//! heap, so a restrictive filter never starves the result set.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

use crate::error::Result;
use crate::index::{read_record, IndexRecord, SecondaryIndex, SELECT_COLUMNS};
use crate::lifecycle::Tier;
use crate::node::{Domain, MemoryStatus, Namespace};

/// Most rows any single search returns
pub const MAX_RESULTS: usize = 10_000;

/// Row filters; empty lists mean "any"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub namespaces: Vec<Namespace>,
    pub domains: Vec<Domain>,
    pub statuses: Vec<MemoryStatus>,
    pub tiers: Vec<Tier>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl SearchFilters {
    /// Active and resolved memories only
    pub fn live() -> Self {
        Self {
            statuses: vec![MemoryStatus::Active, MemoryStatus::Resolved],
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domains.push(domain);
        self
    }

    pub fn status(mut self, status: MemoryStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    /// `AND`-joined SQL conditions (leading ` AND` included) and their values
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut values = Vec::new();

        fn in_list<'a>(
            sql: &mut String,
            values: &mut Vec<Value>,
            column: &str,
            items: impl ExactSizeIterator<Item = &'a str>,
        ) {
            if items.len() == 0 {
                return;
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            sql.push_str(&format!(" AND {column} IN ({placeholders})"));
            values.extend(items.map(|s| Value::Text(s.to_string())));
        }

        in_list(&mut sql, &mut values, "namespace", self.namespaces.iter().map(|n| n.as_str()));
        in_list(&mut sql, &mut values, "domain", self.domains.iter().map(|d| d.as_str()));
        in_list(&mut sql, &mut values, "status", self.statuses.iter().map(|s| s.as_str()));
        in_list(&mut sql, &mut values, "tier", self.tiers.iter().map(|t| t.as_str()));

        if let Some(after) = self.created_after {
            sql.push_str(" AND created_at >= ?");
            values.push(Value::Integer(after.timestamp()));
        }
        if let Some(before) = self.created_before {
            sql.push_str(" AND created_at < ?");
            values.push(Value::Integer(before.timestamp()));
        }
        (sql, values)
    }
}

/// Vector search result; smaller distance is closer
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub record: IndexRecord,
    /// `1 - cosine_similarity`, in `[0, 2]`
    pub distance: f32,
}

/// Cosine similarity; 0 when either vector has zero length
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Heap entry ordered by distance, then id, so the heap top is the worst kept hit
#[derive(Debug)]
struct Scored {
    distance: f32,
    id: String,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern
fn like_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

impl SecondaryIndex {
    /// The `k` filtered rows closest to `query`, by ascending cosine distance.
    ///
    /// Rows whose embedding has a different dimension are not candidates.
    pub fn search_vector(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorHit>> {
        let k = k.min(MAX_RESULTS);
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let (filter_sql, mut values) = filters.to_sql();
        let sql = format!(
            "SELECT id, embedding FROM memories
             WHERE embedding IS NOT NULL AND embedding_dim = ?{filter_sql}"
        );
        values.insert(0, Value::Integer(query.len() as i64));

        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(k + 1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let embedding: Vec<f32> = match bincode::deserialize(&blob) {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("Skipping unreadable embedding for {}: {}", id, e);
                        continue;
                    }
                };
                let candidate = Scored {
                    distance: cosine_distance(query, &embedding),
                    id,
                };
                if heap.len() < k {
                    heap.push(candidate);
                } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                    heap.pop();
                    heap.push(candidate);
                }
            }
            Ok(())
        })?;

        let ranked = heap.into_sorted_vec();
        let keys: Vec<String> = ranked.iter().map(|s| s.id.clone()).collect();
        let mut records = self.get_by_keys(&keys)?;

        Ok(ranked
            .into_iter()
            .filter_map(|scored| {
                records.remove(&scored.id).map(|record| VectorHit {
                    record,
                    distance: scored.distance,
                })
            })
            .collect())
    }

    /// Case-insensitive substring search over summary, content and tags,
    /// newest first.
    ///
    /// This is a `LIKE` scan: O(n) in the number of rows passing `filters`.
    pub fn search_text(
        &self,
        pattern: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexRecord>> {
        self.text_query(pattern, "", Vec::new(), filters, limit)
    }

    /// Substring search restricted to rows [`search_vector`](Self::search_vector)
    /// cannot rank against a `dimension`-sized query: no embedding, or one of
    /// another size.
    pub fn search_text_unranked(
        &self,
        pattern: &str,
        dimension: usize,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexRecord>> {
        self.text_query(
            pattern,
            " AND (embedding IS NULL OR embedding_dim IS NOT ?)",
            vec![Value::Integer(dimension as i64)],
            filters,
            limit,
        )
    }

    fn text_query(
        &self,
        pattern: &str,
        extra_sql: &str,
        extra_values: Vec<Value>,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexRecord>> {
        let limit = limit.min(MAX_RESULTS);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (filter_sql, filter_values) = filters.to_sql();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories
             WHERE (summary LIKE ? ESCAPE '\\' OR content LIKE ? ESCAPE '\\'
                    OR tags LIKE ? ESCAPE '\\'){extra_sql}{filter_sql}
             ORDER BY created_at DESC, id
             LIMIT {limit}"
        );

        let pattern = Value::Text(like_pattern(pattern));
        let mut values = vec![pattern.clone(), pattern.clone(), pattern];
        values.extend(extra_values);
        values.extend(filter_values);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Every row passing `filters`, oldest first
    pub fn scan(&self, filters: &SearchFilters) -> Result<Vec<IndexRecord>> {
        let (filter_sql, values) = filters.to_sql();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE 1 = 1{filter_sql}
             ORDER BY created_at, id"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}
