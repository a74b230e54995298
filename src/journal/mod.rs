//! Durable per-call conversation journal.
//!
//! One `conversations` row per completed call, with dependent rows in
//! `messages`, `summaries`, `analytics`, and `emotional_metrics`. Every
//! multi-row write runs in one transaction; a failed transaction leaves
//! the database unchanged and the caller may retry. The summary is always
//! committed before messages, so a message-save failure can never undo a
//! completed summary save.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{AgentError, Result};

/// Role of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The caller.
    User,
    /// The companion.
    Assistant,
    /// Injected context.
    System,
}

impl MessageRole {
    /// Database column form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse the database column form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Tie-break rank for identical timestamps: user speaks first.
    fn rank(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Assistant => 1,
            Self::System => 2,
        }
    }
}

/// One transcript message, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalMessage {
    /// Speaker role.
    pub role: MessageRole,
    /// UTF-8 text.
    pub content: String,
    /// Wall-clock timestamp, ISO-8601 in the database.
    pub timestamp: DateTime<Utc>,
}

/// Call metadata plus serialized analyzer output, saved as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Vendor-supplied call id.
    pub call_sid: String,
    /// Vendor-supplied media stream id.
    pub stream_sid: Option<String>,
    /// Call start.
    pub start_time: DateTime<Utc>,
    /// Call end.
    pub end_time: DateTime<Utc>,
    /// Serialized conversation summary (analyzer output).
    pub summary: serde_json::Value,
    /// Derived per-call analytics (topic tags, care indicators).
    pub analytics: serde_json::Value,
}

/// Structured emotional metrics from the post-call analysis.
///
/// All four scalars are on a 0–10 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalMetrics {
    /// Anxiety level, 0–10.
    pub anxiety: f64,
    /// Agitation level, 0–10.
    pub agitation: f64,
    /// Confusion level, 0–10.
    pub confusion: f64,
    /// Comfort level, 0–10.
    pub comfort: f64,
    /// Caller mentioned pain or discomfort.
    #[serde(default)]
    pub mentions_pain: bool,
    /// Caller mentioned medication.
    #[serde(default)]
    pub mentions_medication: bool,
    /// Caller talked about family.
    #[serde(default)]
    pub mentions_family: bool,
}

impl EmotionalMetrics {
    /// Clamp every scalar into the documented 0–10 range.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.anxiety = self.anxiety.clamp(0.0, 10.0);
        self.agitation = self.agitation.clamp(0.0, 10.0);
        self.confusion = self.confusion.clamp(0.0, 10.0);
        self.comfort = self.comfort.clamp(0.0, 10.0);
        self
    }
}

/// Handle to the journal tables. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConversationJournal {
    db: Arc<Database>,
}

impl ConversationJournal {
    /// Journal over an existing database handle.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert the conversation row and replace its summary and analytics.
    ///
    /// Keyed on `call_sid`: saving the same call twice yields a single
    /// conversations row with the dependent rows replaced. Returns the
    /// numeric conversation id.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction fails; nothing is written in
    /// that case.
    pub fn save_summary(&self, record: &CallRecord) -> Result<i64> {
        let duration = (record.end_time - record.start_time).num_milliseconds() as f64 / 1000.0;
        let summary_json = record.summary.to_string();
        let analytics_json = record.analytics.to_string();

        self.db
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO conversations \
                     (call_sid, stream_sid, start_time, end_time, duration_seconds) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(call_sid) DO UPDATE SET \
                       stream_sid = excluded.stream_sid, \
                       start_time = excluded.start_time, \
                       end_time = excluded.end_time, \
                       duration_seconds = excluded.duration_seconds",
                    params![
                        record.call_sid,
                        record.stream_sid,
                        record.start_time.to_rfc3339(),
                        record.end_time.to_rfc3339(),
                        duration,
                    ],
                )?;

                let conversation_id: i64 = tx.query_row(
                    "SELECT id FROM conversations WHERE call_sid = ?1",
                    params![record.call_sid],
                    |row| row.get(0),
                )?;

                tx.execute(
                    "DELETE FROM summaries WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
                tx.execute(
                    "DELETE FROM analytics WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
                tx.execute(
                    "INSERT INTO summaries (conversation_id, summary) VALUES (?1, ?2)",
                    params![conversation_id, summary_json],
                )?;
                tx.execute(
                    "INSERT INTO analytics (conversation_id, data) VALUES (?1, ?2)",
                    params![conversation_id, analytics_json],
                )?;

                Ok(conversation_id)
            })
            .map_err(journal_err)
    }

    /// Replace the full message list for a conversation.
    ///
    /// Messages are sorted ascending by timestamp before insertion, with a
    /// stable tie-break putting user before assistant. Existing rows are
    /// deleted first, so the call is idempotent. Returns the stored count.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction fails or the conversation id
    /// is unknown; a completed summary save is unaffected either way.
    pub fn save_messages(
        &self,
        conversation_id: i64,
        messages: &[JournalMessage],
    ) -> Result<usize> {
        let mut ordered: Vec<&JournalMessage> = messages.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.role.rank().cmp(&b.role.rank()))
        });

        self.db
            .with_tx(|tx| {
                let known: u32 = tx.query_row(
                    "SELECT count(*) FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )?;
                if known == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }

                tx.execute(
                    "DELETE FROM messages WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;

                let mut stmt = tx.prepare(
                    "INSERT INTO messages (conversation_id, role, content, timestamp) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for message in &ordered {
                    stmt.execute(params![
                        conversation_id,
                        message.role.as_str(),
                        message.content,
                        message.timestamp.to_rfc3339(),
                    ])?;
                }

                Ok(ordered.len())
            })
            .map_err(journal_err)
    }

    /// Load a conversation's messages in chronological order.
    ///
    /// # Errors
    ///
    /// Returns an error when the call id is unknown or a row is malformed.
    pub fn load_messages(&self, call_sid: &str) -> Result<Vec<JournalMessage>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.role, m.content, m.timestamp \
                     FROM messages m \
                     JOIN conversations c ON c.id = m.conversation_id \
                     WHERE c.call_sid = ?1 \
                     ORDER BY m.timestamp ASC, m.id ASC",
                )?;
                let rows = stmt.query_map(params![call_sid], |row| {
                    let role: String = row.get(0)?;
                    let timestamp: String = row.get(2)?;
                    Ok(JournalMessage {
                        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
                        content: row.get(1)?,
                        timestamp: DateTime::parse_from_rfc3339(&timestamp)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(journal_err)
    }

    /// Persist the post-call emotional metrics for a conversation.
    ///
    /// Independent of the summary/message rows; replaces any previous
    /// metrics for the same conversation.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction fails.
    pub fn save_emotional_metrics(
        &self,
        conversation_id: i64,
        metrics: &EmotionalMetrics,
    ) -> Result<()> {
        let metrics = metrics.clone().clamped();
        let raw = serde_json::to_string(&metrics).unwrap_or_default();

        self.db
            .with_tx(|tx| {
                tx.execute(
                    "DELETE FROM emotional_metrics WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
                tx.execute(
                    "INSERT INTO emotional_metrics \
                     (conversation_id, anxiety, agitation, confusion, comfort, \
                      mentions_pain, mentions_medication, mentions_family, raw) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        conversation_id,
                        metrics.anxiety,
                        metrics.agitation,
                        metrics.confusion,
                        metrics.comfort,
                        metrics.mentions_pain as i64,
                        metrics.mentions_medication as i64,
                        metrics.mentions_family as i64,
                        raw,
                    ],
                )?;
                Ok(())
            })
            .map_err(journal_err)
    }

    /// Load the stored emotional metrics for a conversation, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn load_emotional_metrics(&self, conversation_id: i64) -> Result<Option<EmotionalMetrics>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT anxiety, agitation, confusion, comfort, \
                     mentions_pain, mentions_medication, mentions_family \
                     FROM emotional_metrics WHERE conversation_id = ?1",
                )?;
                let mut rows = stmt.query(params![conversation_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(EmotionalMetrics {
                        anxiety: row.get(0)?,
                        agitation: row.get(1)?,
                        confusion: row.get(2)?,
                        comfort: row.get(3)?,
                        mentions_pain: row.get::<_, i64>(4)? != 0,
                        mentions_medication: row.get::<_, i64>(5)? != 0,
                        mentions_family: row.get::<_, i64>(6)? != 0,
                    })),
                    None => Ok(None),
                }
            })
            .map_err(journal_err)
    }

    /// The stored summary payload for a call, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is not valid JSON.
    pub fn load_summary(&self, call_sid: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.summary FROM summaries s \
                     JOIN conversations c ON c.id = s.conversation_id \
                     WHERE c.call_sid = ?1",
                )?;
                let mut rows = stmt.query(params![call_sid])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .map_err(journal_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| AgentError::Journal(format!("summary row is not JSON: {e}"))),
            None => Ok(None),
        }
    }

    /// Numeric id for a call, if it has been persisted.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn find_conversation_id(&self, call_sid: &str) -> Result<Option<i64>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM conversations WHERE call_sid = ?1")?;
                let mut rows = stmt.query(params![call_sid])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .map_err(journal_err)
    }

    /// Number of conversation rows (used by tests and diagnostics).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub fn conversation_count(&self) -> Result<u64> {
        self.db
            .with_conn(|conn| {
                conn.query_row("SELECT count(*) FROM conversations", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .map(|n| n as u64)
            .map_err(journal_err)
    }
}

fn journal_err(e: crate::db::DbError) -> AgentError {
    AgentError::Journal(e.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
