//! Note wire format
//!
//! A note holds one or more blocks separated by a blank line. A block is a
//! front-matter header between two `---` lines followed by a free-form body:
//!
//! ```text
//! ---
//! type: decisions
//! timestamp: 2026-10-16T09:30:00Z
//! summary: Use PostgreSQL
//! tags: database, storage
//! status: active
//! ---
//! body text
//! ```
//!
//! A block starts at a `---` line that opens the note or follows a blank
//! line. Body lines that would read as `---` are written with an extra
//! leading `\`. Parsing never fails: anything that does not look like a
//! well-formed block is kept as [`NoteEntry::Raw`].

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::node::{
    single_line, Domain, Memory, MemoryEntry, MemoryId, MemoryStatus, Namespace, ENTRY_KEY_LEN,
    MAX_SUMMARY_LEN,
};

const DELIMITER: &str = "---";

pub const KEY_TYPE: &str = "type";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_SUMMARY: &str = "summary";
pub const KEY_TAGS: &str = "tags";
pub const KEY_STATUS: &str = "status";
pub const KEY_SPEC: &str = "spec";
pub const KEY_RELATES_TO: &str = "relates_to";
pub const KEY_SUPERSEDES: &str = "supersedes";
pub const KEY_REDACT: &str = "redact";

const RESERVED_KEYS: [&str; 9] = [
    KEY_TYPE,
    KEY_TIMESTAMP,
    KEY_SUMMARY,
    KEY_TAGS,
    KEY_STATUS,
    KEY_SPEC,
    KEY_RELATES_TO,
    KEY_SUPERSEDES,
    KEY_REDACT,
];

/// Body that replaces redacted content when a status change asks for it
pub const REDACTED_BODY: &str = "[redacted]";

/// Whether `key` is syntactically valid as a header key
pub fn is_header_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    bytes.next().is_some_and(|b| b.is_ascii_alphanumeric())
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Whether `key` is interpreted by this crate (not preserved as extra)
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Why a block could not be read as a well-formed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedEntry {
    /// Text that does not start with a `---` line
    MissingOpening,
    /// Opening `---` without a closing one
    Unterminated,
    /// Header line (1-based, counted after the opening delimiter) is not `key: value`
    InvalidHeaderLine(usize),
    /// No `type` key
    MissingType,
    /// `timestamp` missing or not RFC 3339
    InvalidTimestamp(String),
    /// `supersedes` does not name a memory id
    InvalidSupersedes(String),
}

impl std::fmt::Display for MalformedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOpening => write!(f, "block does not start with a header"),
            Self::Unterminated => write!(f, "header is not terminated"),
            Self::InvalidHeaderLine(n) => write!(f, "header line {n} is not `key: value`"),
            Self::MissingType => write!(f, "header has no type"),
            Self::InvalidTimestamp(v) => write!(f, "invalid timestamp {v:?}"),
            Self::InvalidSupersedes(v) => write!(f, "invalid supersedes reference {v:?}"),
        }
    }
}

/// Ordered header fields, unknown keys included
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteHeader {
    fields: Vec<(String, String)>,
}

impl NoteHeader {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fields this crate does not interpret, in note order
    pub fn extra(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter(|(k, _)| !is_reserved_key(k))
            .cloned()
            .collect()
    }
}

/// One parsed block
#[derive(Debug, Clone, PartialEq)]
pub enum NoteEntry {
    WellFormed { header: NoteHeader, body: String },
    Raw { body: String, malformed: MalformedEntry },
}

impl NoteEntry {
    /// The `timestamp` header exactly as written; empty for raw blocks
    pub fn timestamp_str(&self) -> &str {
        match self {
            Self::WellFormed { header, .. } => header.get(KEY_TIMESTAMP).unwrap_or(""),
            Self::Raw { .. } => "",
        }
    }

    pub fn is_well_formed(&self) -> bool {
        matches!(self, Self::WellFormed { .. })
    }

    /// Interpret this block as a memory or a status change.
    ///
    /// Raw blocks become memories under `namespace` with the block text as
    /// content, a summary taken from the first non-empty line and
    /// `created_at` at the Unix epoch.
    pub fn interpret(
        &self,
        domain: Domain,
        namespace: Namespace,
        object: &str,
        key: &str,
    ) -> crate::error::Result<StoredEntry> {
        let id = MemoryId::new(domain, namespace, object, key)?;
        let stored = match self {
            Self::Raw { body, .. } => StoredEntry::Memory(Memory {
                id,
                summary: derive_summary(body),
                content: body.clone(),
                tags: Vec::new(),
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                status: MemoryStatus::Active,
                spec: None,
                relates_to: Vec::new(),
                extra: Vec::new(),
            }),
            Self::WellFormed { header, body } => {
                let created_at = header
                    .get(KEY_TIMESTAMP)
                    .and_then(parse_timestamp)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                let status = match header.get(KEY_STATUS) {
                    None => MemoryStatus::Active,
                    Some(value) => value.parse().unwrap_or_else(|_| {
                        log::warn!("Unknown status {:?} in {}; treating as active", value, id);
                        MemoryStatus::Active
                    }),
                };

                if let Some(target) = header.get(KEY_SUPERSEDES) {
                    let target = target.parse::<MemoryId>()?;
                    StoredEntry::StatusChange(StatusChange {
                        id,
                        target,
                        status,
                        redact: header.get(KEY_REDACT) == Some("true"),
                        at: created_at,
                    })
                } else {
                    let summary = header
                        .get(KEY_SUMMARY)
                        .map(str::to_string)
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| derive_summary(body));
                    StoredEntry::Memory(Memory {
                        id,
                        summary,
                        content: body.clone(),
                        tags: split_list(header.get(KEY_TAGS)),
                        created_at,
                        status,
                        spec: header
                            .get(KEY_SPEC)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        relates_to: split_list(header.get(KEY_RELATES_TO)),
                        extra: header.extra(),
                    })
                }
            }
        };
        Ok(stored)
    }
}

/// A block interpreted against the namespace it was read from
#[derive(Debug, Clone, PartialEq)]
pub enum StoredEntry {
    Memory(Memory),
    StatusChange(StatusChange),
}

/// Appended record that supersedes the status of an earlier memory
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// Id of the status change entry itself
    pub id: MemoryId,
    pub target: MemoryId,
    pub status: MemoryStatus,
    pub redact: bool,
    pub at: DateTime<Utc>,
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn split_list(value: Option<&str>) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.unwrap_or("").split(',') {
        let item = item.trim();
        if !item.is_empty() && !items.iter().any(|i| i == item) {
            items.push(item.to_string());
        }
    }
    items
}

fn derive_summary(body: &str) -> String {
    let first = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("(empty note)");
    single_line(first).chars().take(MAX_SUMMARY_LEN).collect()
}

fn escape_body_line(line: &str) -> String {
    if line.trim_start_matches('\\') == DELIMITER {
        format!("\\{line}")
    } else {
        line.to_string()
    }
}

fn unescape_body_line(line: &str) -> &str {
    if line.starts_with('\\') && line.trim_start_matches('\\') == DELIMITER {
        &line[1..]
    } else {
        line
    }
}

/// Split note text into block texts. Trailing blank lines of each block are
/// dropped; blank-only notes yield no blocks.
pub fn split_blocks(note: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut previous_blank = true;

    for line in note.lines() {
        if line == DELIMITER && previous_blank {
            push_block(&mut blocks, &current);
            current.clear();
        }
        previous_blank = line.trim().is_empty();
        current.push(line);
    }
    push_block(&mut blocks, &current);
    blocks
}

fn push_block(blocks: &mut Vec<String>, lines: &[&str]) {
    let mut end = lines.len();
    while end > 0 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    let mut start = 0;
    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    if start < end {
        blocks.push(lines[start..end].join("\n"));
    }
}

/// Parse one block. Never fails.
pub fn parse_block(block: &str) -> NoteEntry {
    let raw = |malformed| NoteEntry::Raw {
        body: block.to_string(),
        malformed,
    };

    let mut lines = block.lines();
    if lines.next() != Some(DELIMITER) {
        return raw(MalformedEntry::MissingOpening);
    }

    let mut header = NoteHeader::default();
    let mut terminated = false;
    for (idx, line) in lines.by_ref().enumerate() {
        if line == DELIMITER {
            terminated = true;
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return raw(MalformedEntry::InvalidHeaderLine(idx + 1));
        };
        let key = key.trim();
        if !is_header_key(key) {
            return raw(MalformedEntry::InvalidHeaderLine(idx + 1));
        }
        header.push(key, value.trim());
    }
    if !terminated {
        return raw(MalformedEntry::Unterminated);
    }

    if header.get(KEY_TYPE).map_or(true, str::is_empty) {
        return raw(MalformedEntry::MissingType);
    }
    match header.get(KEY_TIMESTAMP) {
        Some(ts) if parse_timestamp(ts).is_some() => {}
        other => {
            return raw(MalformedEntry::InvalidTimestamp(
                other.unwrap_or_default().to_string(),
            ))
        }
    }
    if let Some(target) = header.get(KEY_SUPERSEDES) {
        if target.parse::<MemoryId>().is_err() {
            return raw(MalformedEntry::InvalidSupersedes(target.to_string()));
        }
    }

    let body = lines.map(unescape_body_line).collect::<Vec<_>>().join("\n");
    NoteEntry::WellFormed { header, body }
}

/// Parse a whole note into entries, in order. Never fails.
pub fn parse_note(note: &str) -> Vec<NoteEntry> {
    split_blocks(note).iter().map(|b| parse_block(b)).collect()
}

/// Key of one block: the first 16 hex digits of the SHA-256 of its text.
///
/// `block` is a block as returned by [`split_blocks`]. The key depends only
/// on the text, never on the block's position in the note.
pub fn entry_key(block: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block.as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(ENTRY_KEY_LEN);
    key
}

/// Key of the block a serialized entry becomes once appended to a note
pub fn serialized_key(text: &str) -> String {
    let blocks = split_blocks(text);
    entry_key(blocks.first().map_or("", String::as_str))
}

/// One block of a note together with its key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEntry {
    pub key: String,
    /// Position of the block within the note
    pub position: u32,
    pub entry: NoteEntry,
}

/// Parse a note into keyed entries, in order. Repeats of an identical block
/// are the same entry and are dropped after the first.
pub fn parse_keyed(note: &str) -> Vec<KeyedEntry> {
    let mut seen = HashSet::new();
    split_blocks(note)
        .into_iter()
        .filter_map(|block| {
            let key = entry_key(&block);
            seen.insert(key.clone()).then(|| (key, block))
        })
        .enumerate()
        .map(|(position, (key, block))| KeyedEntry {
            key,
            position: position as u32,
            entry: parse_block(&block),
        })
        .collect()
}

fn write_header_and_body(header: &[(String, String)], body: &str) -> String {
    let mut out = String::from(DELIMITER);
    out.push('\n');
    for (key, value) in header {
        out.push_str(key);
        out.push(':');
        // No trailing space: git strips it and the block key would change
        if !value.is_empty() {
            out.push(' ');
            out.push_str(value);
        }
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    for line in body.lines() {
        out.push_str(&escape_body_line(line));
        out.push('\n');
    }
    out
}

/// Serialize an entry as one block, newline-terminated
pub fn serialize_entry(entry: &MemoryEntry) -> String {
    let mut header = vec![
        (KEY_TYPE.to_string(), entry.namespace.to_string()),
        (KEY_TIMESTAMP.to_string(), format_timestamp(&entry.timestamp)),
        (KEY_SUMMARY.to_string(), entry.summary.clone()),
    ];
    if !entry.tags.is_empty() {
        header.push((KEY_TAGS.to_string(), entry.tags.join(", ")));
    }
    header.push((KEY_STATUS.to_string(), entry.status.to_string()));
    if let Some(spec) = &entry.spec {
        header.push((KEY_SPEC.to_string(), spec.clone()));
    }
    if !entry.relates_to.is_empty() {
        header.push((KEY_RELATES_TO.to_string(), entry.relates_to.join(", ")));
    }
    header.extend(entry.extra.iter().cloned());
    write_header_and_body(&header, &entry.content)
}

/// Serialize a status change as one block, newline-terminated
pub fn serialize_status_change(
    target: &MemoryId,
    status: MemoryStatus,
    redact: bool,
    at: &DateTime<Utc>,
) -> String {
    let mut header = vec![
        (KEY_TYPE.to_string(), target.namespace.to_string()),
        (KEY_TIMESTAMP.to_string(), format_timestamp(at)),
        (KEY_SUPERSEDES.to_string(), target.to_string()),
        (KEY_STATUS.to_string(), status.to_string()),
    ];
    if redact {
        header.push((KEY_REDACT.to_string(), "true".to_string()));
    }
    write_header_and_body(&header, "")
}
