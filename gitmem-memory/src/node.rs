//! Memory types and builders
//!
//! Core types for representing memories stored in git notes.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Longest summary accepted by [`MemoryEntryBuilder::build`]
pub const MAX_SUMMARY_LEN: usize = 200;

/// Memory partition: the current repository or the user's global store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Project,
    User,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Project, Domain::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            other => Err(MemoryError::validation(format!("unknown domain: {other:?}"))),
        }
    }
}

/// Fixed vocabulary of memory categories. Each maps to exactly one notes ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Inception,
    Elicitation,
    Research,
    Decisions,
    Progress,
    Blockers,
    Reviews,
    Learnings,
    Retrospective,
    Patterns,
}

impl Namespace {
    pub const ALL: [Namespace; 10] = [
        Namespace::Inception,
        Namespace::Elicitation,
        Namespace::Research,
        Namespace::Decisions,
        Namespace::Progress,
        Namespace::Blockers,
        Namespace::Reviews,
        Namespace::Learnings,
        Namespace::Retrospective,
        Namespace::Patterns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inception => "inception",
            Self::Elicitation => "elicitation",
            Self::Research => "research",
            Self::Decisions => "decisions",
            Self::Progress => "progress",
            Self::Blockers => "blockers",
            Self::Reviews => "reviews",
            Self::Learnings => "learnings",
            Self::Retrospective => "retrospective",
            Self::Patterns => "patterns",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| MemoryError::validation(format!("unknown namespace: {s:?}")))
    }
}

/// Lifecycle status. The only mutable part of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    #[default]
    Active,
    Resolved,
    Archived,
    Tombstoned,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Archived => "archived",
            Self::Tombstoned => "tombstoned",
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "archived" => Ok(Self::Archived),
            "tombstoned" => Ok(Self::Tombstoned),
            other => Err(MemoryError::validation(format!("unknown status: {other:?}"))),
        }
    }
}

/// Check that `object` is a full lowercase hex object id (SHA-1 or SHA-256).
pub fn validate_object_id(object: &str) -> Result<()> {
    let valid_len = object.len() == 40 || object.len() == 64;
    let valid_chars = object
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "invalid object id: {object:?}"
        )))
    }
}

/// Length of an entry key in hex digits
pub const ENTRY_KEY_LEN: usize = 16;

/// Check that `key` is an entry key: 16 lowercase hex digits.
pub fn validate_entry_key(key: &str) -> Result<()> {
    let valid = key.len() == ENTRY_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(())
    } else {
        Err(MemoryError::validation(format!("invalid entry key: {key:?}")))
    }
}

/// Stable identifier: `<domain>:<namespace>:<object>:<key>`
///
/// `object` is the commit the note is attached to. `key` is derived from the
/// entry's text (see [`crate::note::entry_key`]), so it survives merges that
/// reorder the blocks of a note.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MemoryId {
    pub domain: Domain,
    pub namespace: Namespace,
    pub object: String,
    pub key: String,
}

impl MemoryId {
    /// Create an id, validating the object and key components
    pub fn new(
        domain: Domain,
        namespace: Namespace,
        object: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self> {
        let object = object.into();
        let key = key.into();
        validate_object_id(&object)?;
        validate_entry_key(&key)?;
        Ok(Self {
            domain,
            namespace,
            object,
            key,
        })
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.domain, self.namespace, self.object, self.key
        )
    }
}

impl std::str::FromStr for MemoryId {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [domain, namespace, object, key] = parts.as_slice() else {
            return Err(MemoryError::validation(format!("malformed memory id: {s:?}")));
        };
        Self::new(domain.parse()?, namespace.parse()?, *object, *key)
    }
}

impl From<MemoryId> for String {
    fn from(id: MemoryId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MemoryId {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A committed memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub summary: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: MemoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default)]
    pub relates_to: Vec<String>,
    /// Header keys this version does not interpret, kept in note order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<(String, String)>,
}

impl Memory {
    /// Materialize a committed entry under its id
    pub fn from_entry(id: MemoryId, entry: MemoryEntry) -> Self {
        Self {
            id,
            summary: entry.summary,
            content: entry.content,
            tags: entry.tags,
            created_at: entry.timestamp,
            status: entry.status,
            spec: entry.spec,
            relates_to: entry.relates_to,
            extra: entry.extra,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.id.namespace
    }

    pub fn domain(&self) -> Domain {
        self.id.domain
    }

    /// Get the searchable text for this memory
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.summary, self.content, self.tags.join(" "))
    }
}

/// A memory that has not been committed yet
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub namespace: Namespace,
    pub summary: String,
    pub content: String,
    pub tags: Vec<String>,
    pub status: MemoryStatus,
    pub spec: Option<String>,
    pub relates_to: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub extra: Vec<(String, String)>,
}

impl MemoryEntry {
    /// Create a new builder for a memory entry
    pub fn builder(namespace: Namespace) -> MemoryEntryBuilder {
        MemoryEntryBuilder::new(namespace)
    }

    /// Get the searchable text for this entry
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.summary, self.content, self.tags.join(" "))
    }
}

/// Builder for MemoryEntry with fluent API
#[derive(Debug)]
pub struct MemoryEntryBuilder {
    namespace: Namespace,
    summary: Option<String>,
    content: String,
    tags: Vec<String>,
    status: MemoryStatus,
    spec: Option<String>,
    relates_to: Vec<String>,
    timestamp: Option<DateTime<Utc>>,
    extra: Vec<(String, String)>,
}

impl MemoryEntryBuilder {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            summary: None,
            content: String::new(),
            tags: Vec::new(),
            status: MemoryStatus::Active,
            spec: None,
            relates_to: Vec::new(),
            timestamp: None,
            extra: Vec::new(),
        }
    }

    /// Set the one-line summary
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set the body
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set multiple tags
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn status(mut self, status: MemoryStatus) -> Self {
        self.status = status;
        self
    }

    /// Correlate with a spec or ticket id
    pub fn spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = Some(spec.into());
        self
    }

    /// Add a back-reference to another memory
    pub fn relates_to(mut self, id: impl Into<String>) -> Self {
        self.relates_to.push(id.into());
        self
    }

    /// Override the creation time (defaults to now)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach an extra header key
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Build the MemoryEntry
    ///
    /// Normalizes whitespace the way git stores note text and truncates the
    /// timestamp to whole seconds, so the committed note and the indexed row
    /// agree exactly.
    pub fn build(self) -> std::result::Result<MemoryEntry, EntryBuilderError> {
        let summary = self.summary.ok_or(EntryBuilderError::MissingSummary)?;
        let summary = single_line(&summary);
        if summary.is_empty() {
            return Err(EntryBuilderError::MissingSummary);
        }
        if summary.chars().count() > MAX_SUMMARY_LEN {
            return Err(EntryBuilderError::SummaryTooLong(summary.chars().count()));
        }

        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags {
            let tag = single_line(&tag);
            if tag.contains(',') {
                return Err(EntryBuilderError::InvalidTag(tag));
            }
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let spec = self.spec.map(|s| single_line(&s)).filter(|s| !s.is_empty());

        let mut relates_to = Vec::new();
        for id in self.relates_to {
            let id = id.trim().to_string();
            if id.is_empty() || id.contains(',') || id.chars().any(char::is_whitespace) {
                return Err(EntryBuilderError::InvalidReference(id));
            }
            if !relates_to.contains(&id) {
                relates_to.push(id);
            }
        }

        let mut extra = Vec::new();
        for (key, value) in self.extra {
            if !crate::note::format::is_header_key(&key) || crate::note::format::is_reserved_key(&key)
            {
                return Err(EntryBuilderError::InvalidHeader(key));
            }
            extra.push((key, single_line(&value)));
        }

        Ok(MemoryEntry {
            namespace: self.namespace,
            summary,
            content: normalize_body(&self.content),
            tags,
            status: self.status,
            spec,
            relates_to,
            timestamp: self.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(0),
            extra,
        })
    }
}

/// Errors that can occur when building a MemoryEntry
#[derive(Debug, thiserror::Error)]
pub enum EntryBuilderError {
    #[error("Missing required field: summary")]
    MissingSummary,
    #[error("Summary is {0} characters, limit is {MAX_SUMMARY_LEN}")]
    SummaryTooLong(usize),
    #[error("Tags may not contain commas: {0:?}")]
    InvalidTag(String),
    #[error("Invalid memory reference: {0:?}")]
    InvalidReference(String),
    #[error("Invalid or reserved header key: {0:?}")]
    InvalidHeader(String),
}

/// Collapse all whitespace runs (including newlines) to single spaces
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize body text the way `git notes` stores it: trailing whitespace is
/// stripped from every line, runs of blank lines collapse to one, and
/// leading/trailing blank lines are dropped.
pub fn normalize_body(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
