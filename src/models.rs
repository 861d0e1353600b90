//! Core data models used throughout the monitor.
//!
//! These types describe tracked documents, the snapshots retained for them,
//! and the diff records produced between two snapshots. The persisted JSON
//! shape of [`SnapshotMeta`] and [`DiffMeta`] is what lands in the blob
//! store's `metadata.json` files.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::detector::{ChangeState, Tier};
use crate::error::{MonitorError, Result};

// ============ Timestamps ============

/// A snapshot version identifier.
///
/// UTC instant truncated to microseconds. Rendered as
/// `YYYY-MM-DDTHH-MM-SS-ffffffZ`, a fixed-width form without colons so it is
/// safe as a storage key segment and sorts lexicographically in
/// chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.trunc_subsecs(6))
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next_after(self) -> Self {
        Self(self.0 + Duration::microseconds(1))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    /// The storage key form.
    pub fn key(&self) -> String {
        format!(
            "{}-{:06}Z",
            self.0.format("%Y-%m-%dT%H-%M-%S"),
            self.0.timestamp_subsec_micros()
        )
    }

    fn parse_key(s: &str) -> Option<Self> {
        // 2024-05-01T12-30-45-123456Z
        if s.len() != 27 || !s.ends_with('Z') || s.as_bytes()[19] != b'-' {
            return None;
        }
        let base = NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%dT%H-%M-%S").ok()?;
        let micros: i64 = s[20..26].parse().ok()?;
        Some(Self(
            (base + Duration::microseconds(micros)).and_utc(),
        ))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Timestamp {
    type Err = MonitorError;

    /// Accepts the key form or any RFC 3339 instant.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(ts) = Self::parse_key(s) {
            return Ok(ts);
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|_| MonitorError::InvalidInput(format!("invalid timestamp: '{}'", s)))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============ Selectors ============

/// Addresses one snapshot of a document.
///
/// `current`, `last` and `prev` are relative pointers (newest, second
/// newest, third newest) derived from the ordered history on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Current,
    Last,
    Prev,
    /// Exact snapshot timestamp.
    At(Timestamp),
    /// Newest snapshot taken on the given UTC calendar day.
    Day(NaiveDate),
}

impl Selector {
    /// Position from the newest entry for relative pointers.
    pub fn rank(&self) -> Option<usize> {
        match self {
            Selector::Current => Some(0),
            Selector::Last => Some(1),
            Selector::Prev => Some(2),
            Selector::At(_) | Selector::Day(_) => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Current => f.write_str("current"),
            Selector::Last => f.write_str("last"),
            Selector::Prev => f.write_str("prev"),
            Selector::At(ts) => write!(f, "{}", ts),
            Selector::Day(day) => write!(f, "{}", day.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for Selector {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "current" => return Ok(Selector::Current),
            "last" => return Ok(Selector::Last),
            "prev" | "previous" => return Ok(Selector::Prev),
            _ => {}
        }
        if trimmed.len() == 10 {
            if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                return Ok(Selector::Day(day));
            }
        }
        trimmed.parse::<Timestamp>().map(Selector::At).map_err(|_| {
            MonitorError::InvalidInput(format!(
                "invalid selector '{}': expected current, last, prev, YYYY-MM-DD, or a snapshot timestamp",
                s
            ))
        })
    }
}

// ============ Document configuration ============

/// One tracked document, as listed in `config/documents.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The `config/documents.json` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentConfig>,
}

impl DocumentList {
    /// Parse and validate a document list.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let list: DocumentList = serde_json::from_slice(bytes)
            .map_err(|e| MonitorError::Config(format!("config/documents.json: {}", e)))?;
        list.validate()?;
        Ok(list)
    }

    pub fn validate(&self) -> Result<()> {
        if self.documents.is_empty() {
            return Err(MonitorError::Config(
                "no documents configured in config/documents.json".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for doc in &self.documents {
            if !is_valid_doc_id(&doc.id) {
                return Err(MonitorError::Config(format!(
                    "invalid document id '{}': use letters, digits, '.', '_' or '-'",
                    doc.id
                )));
            }
            if !seen.insert(doc.id.as_str()) {
                return Err(MonitorError::Config(format!(
                    "duplicate document id '{}'",
                    doc.id
                )));
            }
            if doc.name.trim().is_empty() {
                return Err(MonitorError::Config(format!(
                    "document '{}' has an empty name",
                    doc.id
                )));
            }
            let scheme_ok = ["http://", "https://", "file://"]
                .iter()
                .any(|scheme| doc.url.starts_with(scheme));
            if !scheme_ok {
                return Err(MonitorError::Config(format!(
                    "document '{}' has unsupported url '{}'",
                    doc.id, doc.url
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&DocumentConfig> {
        self.documents.iter().find(|d| d.id == id)
    }
}

/// Document ids become storage key segments, so they are restricted to a
/// conservative character set.
pub fn is_valid_doc_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ============ Snapshots ============

/// The three hash tiers of a normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content_hash: String,
    pub structural_hash: String,
    pub fingerprint_hash: String,
}

/// Everything persisted in a snapshot's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub doc_id: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub hashes: Fingerprint,
    #[serde(default)]
    pub raw_reference: Option<String>,
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_length: usize,
    /// Classification made by the change detector when this snapshot was
    /// written.
    #[serde(default)]
    pub change: Option<ChangeState>,
    #[serde(default)]
    pub tier: Option<Tier>,
}

/// One retained version of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub meta: SnapshotMeta,
    pub content: String,
}

impl Snapshot {
    /// Build a snapshot of normalized `content`, computing its hash tiers.
    pub fn from_text(doc_id: &str, timestamp: Timestamp, content: &str) -> Self {
        Self {
            meta: SnapshotMeta {
                doc_id: doc_id.to_string(),
                timestamp,
                hashes: crate::hashing::fingerprint(content),
                raw_reference: None,
                document_name: None,
                url: None,
                title: None,
                content_length: content.chars().count(),
                change: None,
                tier: None,
            },
            content: content.to_string(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.meta.doc_id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.meta.timestamp
    }
}

// ============ Diffs ============

/// Everything persisted in a diff's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffMeta {
    pub doc_id: String,
    #[serde(default)]
    pub document_name: Option<String>,
    pub from_timestamp: Timestamp,
    pub to_timestamp: Timestamp,
    pub generated_at: DateTime<Utc>,
    /// Key of the prompt template used, or `builtin`.
    pub prompt_used: String,
    #[serde(default)]
    pub model: String,
    /// Whether the two snapshots differ at the fingerprint tier.
    #[serde(default)]
    pub substantive: bool,
}

/// An immutable natural-language comparison of two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    #[serde(flatten)]
    pub meta: DiffMeta,
    pub summary_text: String,
}

/// Addresses a stored diff record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSelector {
    /// The most recently generated record for the document.
    Latest,
    Pair(Timestamp, Timestamp),
}

// ============ Summaries ============

/// Pointer summary for one document, as returned by list-documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub doc_id: String,
    pub current: Option<Timestamp>,
    pub last: Option<Timestamp>,
    pub prev: Option<Timestamp>,
    /// `current` differs from `last` at the fingerprint tier.
    pub changed: bool,
    pub total: usize,
}
