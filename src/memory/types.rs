//! Record types and key handling for the memory store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Family members, relationships, names.
    Family,
    /// Health conditions, medication, care routines.
    Health,
    /// Likes, dislikes, comfort topics.
    Preferences,
    /// Subjects the companion must steer away from.
    TopicsToAvoid,
    /// Everything else.
    General,
}

impl MemoryCategory {
    /// Stable snake_case form used in the database column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Family => "family",
            Self::Health => "health",
            Self::Preferences => "preferences",
            Self::TopicsToAvoid => "topics_to_avoid",
            Self::General => "general",
        }
    }

    /// Parse the database column form; unknown strings map to `General`.
    pub fn parse(s: &str) -> Self {
        match s {
            "family" => Self::Family,
            "health" => Self::Health,
            "preferences" => Self::Preferences,
            "topics_to_avoid" => Self::TopicsToAvoid,
            _ => Self::General,
        }
    }
}

/// A content-keyed persistent memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Normalized unique key (`[a-z0-9-]+`).
    pub key: String,
    /// The remembered content.
    pub content: String,
    /// Record category.
    pub category: MemoryCategory,
    /// Facts are protected from pipeline-invoked deletion and update.
    pub is_fact: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Last read time, touched asynchronously by `get`.
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Whether a save created a new record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveAction {
    /// A new row was inserted.
    Created,
    /// An existing row was overwritten.
    Updated,
}

/// Result of a successful save.
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    /// The key the record landed under.
    pub key: String,
    /// Created vs updated.
    pub action: SaveAction,
}

/// Result of a remove request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOutcome {
    /// The record was deleted.
    Removed,
    /// No record under that key.
    NotFound,
    /// The record is a fact and the caller did not force.
    Protected,
}

/// Result of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The record was rewritten.
    Updated,
    /// No record under that key.
    NotFound,
    /// The record is a fact and the caller did not force.
    Protected,
}

/// Key listing used to populate the system prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryKeys {
    /// Keys of fact records (trusted, caller-entered).
    pub facts: Vec<String>,
    /// Keys of ordinary records (model-observed).
    pub memories: Vec<String>,
}

/// Capability for suggesting a memory key from content.
///
/// Implemented by the LLM adapter; the store falls back to
/// [`derive_key_from_content`] when the suggestion is unavailable.
#[async_trait::async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Suggest a short key for `content`, or `None` when unavailable.
    async fn suggest_key(&self, content: &str) -> Option<String>;
}

/// Normalize a raw key to `[a-z0-9-]+`.
///
/// Lowercases, maps every non-alphanumeric run to a single `-`, and trims
/// leading/trailing dashes.
pub fn normalize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Deterministic fallback key derivation.
///
/// Slugifies the first six words of the content; degenerate content (no
/// alphanumerics) falls back to a short content hash so the key is never
/// empty.
pub fn derive_key_from_content(content: &str) -> String {
    let slug = normalize_key(
        &content
            .split_whitespace()
            .take(6)
            .collect::<Vec<_>>()
            .join(" "),
    );
    if !slug.is_empty() {
        return slug;
    }
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("memory-{hex}")
}
