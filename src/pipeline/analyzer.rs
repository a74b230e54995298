//! In-memory per-call conversation analysis.
//!
//! Collects utterances, responses, and interruption events as the call
//! runs, then produces the summary and analytics payloads on close with
//! no additional network I/O. Lists only ever grow; an interruption is a
//! separate event and never deletes tracked text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::journal::{JournalMessage, MessageRole};

/// A tracked line of conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedText {
    /// The text.
    pub text: String,
    /// When it was tracked.
    pub at: DateTime<Utc>,
}

/// Care-relevant signals scanned from the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CareIndicators {
    /// Caller mentioned pain or discomfort.
    pub mentions_pain: bool,
    /// Caller mentioned medication.
    pub mentions_medication: bool,
    /// Caller talked about family.
    pub mentions_family: bool,
    /// Count of disorientation phrases ("where am I", "what day is it").
    pub confusion_signals: u32,
}

/// Aggregated per-call summary, serialized into the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Call start.
    pub start_time: DateTime<Utc>,
    /// Call end.
    pub end_time: DateTime<Utc>,
    /// Duration in seconds.
    pub duration_seconds: f64,
    /// Finalized user utterances.
    pub user_utterance_count: usize,
    /// Assistant reply segments tracked.
    pub assistant_response_count: usize,
    /// Barge-in events.
    pub interruption_count: usize,
    /// Mean word count of user utterances.
    pub average_user_words: f64,
    /// Topics the conversation touched.
    pub topic_tags: Vec<String>,
    /// Care signals.
    pub care_indicators: CareIndicators,
}

/// Per-call event collector.
#[derive(Debug)]
pub struct ConversationAnalyzer {
    started_at: DateTime<Utc>,
    user_utterances: Vec<TimedText>,
    assistant_responses: Vec<TimedText>,
    interruptions: Vec<DateTime<Utc>>,
}

impl ConversationAnalyzer {
    /// New analyzer anchored at the call start.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            user_utterances: Vec::new(),
            assistant_responses: Vec::new(),
            interruptions: Vec::new(),
        }
    }

    /// Track a finalized user utterance.
    pub fn add_user_utterance(&mut self, text: &str) {
        self.user_utterances.push(TimedText {
            text: text.to_owned(),
            at: Utc::now(),
        });
    }

    /// Track one assistant reply segment as it is received from the model
    /// (not when it is spoken).
    pub fn add_assistant_response(&mut self, text: &str) {
        self.assistant_responses.push(TimedText {
            text: text.to_owned(),
            at: Utc::now(),
        });
    }

    /// Record a barge-in event.
    pub fn record_interruption(&mut self) {
        self.interruptions.push(Utc::now());
    }

    /// Number of interruptions recorded so far.
    pub fn interruption_count(&self) -> usize {
        self.interruptions.len()
    }

    /// Whether anything was tracked at all.
    pub fn is_empty(&self) -> bool {
        self.user_utterances.is_empty() && self.assistant_responses.is_empty()
    }

    /// Produce the summary for a call that ended at `end_time`.
    pub fn finalize(&self, end_time: DateTime<Utc>) -> ConversationSummary {
        let user_words: usize = self
            .user_utterances
            .iter()
            .map(|u| u.text.split_whitespace().count())
            .sum();
        let average_user_words = if self.user_utterances.is_empty() {
            0.0
        } else {
            user_words as f64 / self.user_utterances.len() as f64
        };

        let all_user_text = self
            .user_utterances
            .iter()
            .map(|u| u.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        ConversationSummary {
            start_time: self.started_at,
            end_time,
            duration_seconds: (end_time - self.started_at).num_milliseconds() as f64 / 1000.0,
            user_utterance_count: self.user_utterances.len(),
            assistant_response_count: self.assistant_responses.len(),
            interruption_count: self.interruptions.len(),
            average_user_words,
            topic_tags: derive_topic_tags(&all_user_text),
            care_indicators: derive_care_indicators(&all_user_text),
        }
    }

    /// The transcript as journal messages, timestamp-ascending with the
    /// stable user-before-assistant tie-break.
    pub fn messages(&self) -> Vec<JournalMessage> {
        let mut messages: Vec<JournalMessage> = self
            .user_utterances
            .iter()
            .map(|u| JournalMessage {
                role: MessageRole::User,
                content: u.text.clone(),
                timestamp: u.at,
            })
            .chain(self.assistant_responses.iter().map(|r| JournalMessage {
                role: MessageRole::Assistant,
                content: r.text.clone(),
                timestamp: r.at,
            }))
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| role_rank(a.role).cmp(&role_rank(b.role)))
        });
        messages
    }
}

fn role_rank(role: MessageRole) -> u8 {
    match role {
        MessageRole::User => 0,
        MessageRole::Assistant => 1,
        MessageRole::System => 2,
    }
}

/// Keyword groups for topic tagging.
const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("family", &["daughter", "son", "grandchild", "grandson", "granddaughter", "husband", "wife", "sister", "brother", "family"]),
    ("health", &["doctor", "nurse", "hospital", "appointment", "medicine", "medication", "pill", "hurt", "pain"]),
    ("food", &["breakfast", "lunch", "dinner", "hungry", "eat", "tea", "coffee", "food"]),
    ("weather", &["weather", "rain", "sunny", "cold", "warm", "snow"]),
    ("music", &["music", "song", "sing", "radio"]),
    ("news", &["news", "headline", "television", "paper"]),
    ("sleep", &["sleep", "tired", "nap", "night", "bed"]),
];

/// Disorientation phrases counted as confusion signals.
const CONFUSION_PHRASES: &[&str] = &[
    "where am i",
    "who are you",
    "what day",
    "what time",
    "i don't remember",
    "i can't remember",
    "i'm lost",
    "confused",
];

fn derive_topic_tags(user_text: &str) -> Vec<String> {
    TOPIC_KEYWORDS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| user_text.contains(w)))
        .map(|(tag, _)| (*tag).to_owned())
        .collect()
}

fn derive_care_indicators(user_text: &str) -> CareIndicators {
    CareIndicators {
        mentions_pain: ["pain", "hurt", "ache", "sore"]
            .iter()
            .any(|w| user_text.contains(w)),
        mentions_medication: ["medication", "medicine", "pill", "prescription"]
            .iter()
            .any(|w| user_text.contains(w)),
        mentions_family: TOPIC_KEYWORDS[0].1.iter().any(|w| user_text.contains(w)),
        confusion_signals: CONFUSION_PHRASES
            .iter()
            .filter(|p| user_text.contains(*p))
            .count() as u32,
    }
}
