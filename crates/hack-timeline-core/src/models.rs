//! Data models shared by the scrape pipeline, the stores, and the query API.
//!
//! A [`Record`] is an immutable fact extracted from one [`Post`]. Two record
//! kinds exist ([`RecordKind::Hacking`] and [`RecordKind::Transfer`]); they
//! share the same lifecycle and tag model and differ only in their
//! [`RecordFields`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two record shapes the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Hacking,
    Transfer,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Hacking, RecordKind::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Hacking => "hacking",
            RecordKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hacking" => Ok(RecordKind::Hacking),
            "transfer" => Ok(RecordKind::Transfer),
            other => anyhow::bail!("unknown record kind: '{}'. Must be hacking or transfer", other),
        }
    }
}

/// Kind-specific record fields.
///
/// Amounts and addresses stay as the strings the source reported; nothing is
/// parsed into currency types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordFields {
    Hacking {
        protocol: String,
        network: String,
        amount: String,
        tx_hash: String,
    },
    Transfer {
        token: String,
        amount: String,
        from: String,
        to: String,
    },
}

impl RecordFields {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordFields::Hacking { .. } => RecordKind::Hacking,
            RecordFields::Transfer { .. } => RecordKind::Transfer,
        }
    }

    /// Short human label for logs (`tx hash` or `amount token`).
    pub fn summary(&self) -> String {
        match self {
            RecordFields::Hacking {
                protocol, tx_hash, ..
            } => format!("{} {}", protocol, tx_hash),
            RecordFields::Transfer { amount, token, .. } => format!("{} {}", amount, token),
        }
    }
}

/// A normalized, globally unique label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// A stored record with its full tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Store-assigned, monotonically increasing; doubles as pagination cursor.
    pub id: i64,
    pub kind: RecordKind,
    pub channel: String,
    pub message_id: i64,
    /// When the underlying event was reported, not when it was scraped.
    pub report_time: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: RecordFields,
    pub tags: Vec<Tag>,
}

/// A record that has not been inserted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub channel: String,
    pub message_id: i64,
    pub report_time: DateTime<Utc>,
    pub fields: RecordFields,
}

impl NewRecord {
    pub fn kind(&self) -> RecordKind {
        self.fields.kind()
    }
}

/// Highest fully-processed message id for one channel of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub kind: RecordKind,
    pub channel: String,
    pub last_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// A raw post as returned by a source gateway, already shaped for extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub channel: String,
    pub message_id: i64,
    pub report_time: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    /// Fields the source already parsed out of the message (network, amount, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Tags the source attached itself, merged with extracted ones.
    #[serde(default)]
    pub tag_hints: Vec<String>,
}

impl Post {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// The structured output of an extractor for one post.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: RecordFields,
    pub tag_names: Vec<String>,
}

/// Trim, lowercase, drop empties, and collapse duplicates (first occurrence wins).
pub fn normalize_tag_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| n.as_ref().trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.clone()))
        .collect()
}
