//! Streaming language-model adapter with function-calling.
//!
//! One [`LlmAdapter`] per call session. `completion` launches a streaming
//! turn; assistant text is split on the configured delimiter into ordered
//! [`ReplySegment`]s that flow to synthesis, and tool calls are dispatched
//! through the [`FunctionRegistry`](functions::FunctionRegistry) before the
//! turn continues. Each turn has a unique id; events from a cancelled or
//! superseded turn are discarded.

pub mod functions;
pub mod prompt;
mod stream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::journal::{EmotionalMetrics, JournalMessage};
use crate::memory::KeyGenerator;
use crate::retry::{Classified, RetryPolicy, classify_status};
use functions::{FunctionRegistry, ToolDefinition, tool_definitions};
use stream::{CompletionDecoder, StreamItem};

/// Role of a chat message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Persona and memory context.
    System,
    /// Caller transcription.
    User,
    /// Model output.
    Assistant,
    /// Function result.
    Tool,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// Vendor call id, echoed in the tool result message.
    pub call_id: String,
    /// Function name.
    pub name: String,
    /// Raw JSON argument string.
    pub arguments: String,
}

/// One message in the turn history.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Speaker role.
    pub role: Role,
    /// Text content (empty for pure tool-call messages).
    pub content: String,
    /// Tool calls attached to an assistant message.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Call id this message answers (tool role only).
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// Assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant message carrying tool calls.
    pub fn assistant_with_tool_calls(content: String, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// One delimiter-bounded chunk of assistant text, the unit of synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySegment {
    /// Turn this segment belongs to.
    pub turn_id: u64,
    /// Ordering key, `0..k` within the turn.
    pub index: u32,
    /// Segment text, trimmed.
    pub text: String,
    /// Terminal marker: set on the post-last-delimiter remainder.
    pub is_final: bool,
    /// Interaction counter tag carried through to synthesis.
    pub interaction_count: u32,
}

/// Events emitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmTurnEvent {
    /// An ordered reply segment ready for synthesis.
    Segment(ReplySegment),
    /// The turn's stream finished cleanly.
    Completed {
        /// Which turn finished.
        turn_id: u64,
    },
    /// The turn failed mid-stream; no further segments will arrive.
    Failed {
        /// Which turn failed.
        turn_id: u64,
        /// Classified description, never shown to the caller.
        message: String,
    },
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

struct LlmInner {
    config: LlmConfig,
    client: reqwest::Client,
    history: Mutex<Vec<ChatMessage>>,
    functions: Arc<FunctionRegistry>,
    events: mpsc::Sender<LlmTurnEvent>,
    active: Mutex<Option<ActiveTurn>>,
    next_turn: AtomicU64,
}

/// Streaming chat-completion adapter. Cheap to clone.
#[derive(Clone)]
pub struct LlmAdapter {
    inner: Arc<LlmInner>,
}

impl std::fmt::Debug for LlmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAdapter")
            .field("model", &self.inner.config.model)
            .field("endpoint", &self.inner.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl LlmAdapter {
    /// New adapter for one call session.
    pub fn new(
        config: LlmConfig,
        functions: Arc<FunctionRegistry>,
        events: mpsc::Sender<LlmTurnEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(LlmInner {
                config,
                client: reqwest::Client::new(),
                history: Mutex::new(Vec::new()),
                functions,
                events,
                active: Mutex::new(None),
                next_turn: AtomicU64::new(1),
            }),
        }
    }

    /// Install (or replace) the system prompt at the head of the history.
    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let mut history = self.lock_history();
        let message = ChatMessage::system(prompt);
        match history.first_mut() {
            Some(first) if first.role == Role::System => *first = message,
            _ => history.insert(0, message),
        }
    }

    /// Record an assistant line that was spoken outside a model turn
    /// (greeting, apology) so later turns see it in context.
    pub fn note_assistant_line(&self, text: impl Into<String>) {
        self.lock_history().push(ChatMessage::assistant(text));
    }

    /// Start a streaming turn for one finalized user utterance.
    ///
    /// Any still-active turn is cancelled first, preserving the
    /// at-most-one-turn invariant. Returns the new turn id.
    pub fn completion(&self, user_text: &str, interaction_count: u32) -> u64 {
        let turn_id = self.inner.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut active = self.lock_active();
            if let Some(previous) = active.take() {
                warn!(previous = previous.id, "cancelling superseded turn");
                previous.cancel.cancel();
            }
            *active = Some(ActiveTurn {
                id: turn_id,
                cancel: cancel.clone(),
            });
        }

        self.lock_history().push(ChatMessage::user(user_text));

        let adapter = self.clone();
        let interaction = interaction_count;
        tokio::spawn(async move {
            adapter.run_turn(turn_id, cancel, interaction).await;
        });

        turn_id
    }

    /// Abort the in-flight turn; late events from it are discarded.
    pub fn cancel(&self) {
        if let Some(turn) = self.lock_active().take() {
            info!(turn = turn.id, "LLM turn cancelled");
            turn.cancel.cancel();
        }
    }

    /// Snapshot of the turn history.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock_history().clone()
    }

    async fn run_turn(&self, turn_id: u64, cancel: CancellationToken, interaction_count: u32) {
        debug!(turn_id, interaction_count, "LLM turn starting");
        let outcome = tokio::time::timeout(
            self.inner.config.turn_timeout,
            self.stream_turn(turn_id, &cancel, interaction_count),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                if self.finish_if_current(turn_id) {
                    let _ = self.inner.events.send(LlmTurnEvent::Completed { turn_id }).await;
                }
            }
            Ok(Err(AgentError::Cancelled)) => {
                debug!(turn_id, "LLM turn ended by cancellation");
            }
            Ok(Err(e)) => {
                warn!(turn_id, error = %e, "LLM turn failed");
                if self.finish_if_current(turn_id) {
                    let _ = self
                        .inner
                        .events
                        .send(LlmTurnEvent::Failed {
                            turn_id,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            Err(_elapsed) => {
                warn!(turn_id, "LLM turn hit the overall timeout");
                if self.finish_if_current(turn_id) {
                    let _ = self
                        .inner
                        .events
                        .send(LlmTurnEvent::Failed {
                            turn_id,
                            message: "turn timeout".to_owned(),
                        })
                        .await;
                }
            }
        }
    }

    async fn stream_turn(
        &self,
        turn_id: u64,
        cancel: &CancellationToken,
        interaction_count: u32,
    ) -> Result<()> {
        let mut splitter = SegmentSplitter::new(self.inner.config.segment_delimiter);
        let mut next_index: u32 = 0;
        let mut assistant_text = String::new();
        let tools = tool_definitions();

        loop {
            let body = build_completion_body(
                &self.inner.config.model,
                &self.history(),
                &tools,
                self.inner.config.max_tokens,
                true,
            );
            let url = chat_completions_url(&self.inner.config.endpoint);

            let request = self
                .inner
                .client
                .post(&url)
                .bearer_auth(&self.inner.config.api_key)
                .json(&body)
                .send();

            let response = tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = request => {
                    result.map_err(|e| AgentError::Llm(format!("request failed: {e}")))?
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                return Err(map_http_error(status.as_u16(), &body_text));
            }

            let mut byte_stream = response.bytes_stream();
            let mut decoder = CompletionDecoder::new();
            let mut finish: Option<String> = None;
            let mut stream_ended = false;

            while finish.is_none() && !stream_ended {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => return Err(AgentError::Cancelled),
                    chunk = byte_stream.next() => chunk,
                };
                let items = match chunk {
                    Some(Ok(bytes)) => decoder.feed(&bytes),
                    Some(Err(e)) => {
                        return Err(AgentError::Llm(format!("stream read failed: {e}")));
                    }
                    None => {
                        stream_ended = true;
                        decoder.finish()
                    }
                };
                for item in items {
                    match item {
                        StreamItem::Text(delta) => {
                            assistant_text.push_str(&delta);
                            for text in splitter.push(&delta) {
                                self.emit_segment(
                                    turn_id,
                                    &mut next_index,
                                    text,
                                    false,
                                    interaction_count,
                                )
                                .await?;
                            }
                        }
                        StreamItem::Finish(reason) => finish = Some(reason),
                        StreamItem::Done => stream_ended = true,
                    }
                }
            }

            if finish.as_deref() == Some("tool_calls") {
                let calls = decoder.take_tool_calls();
                if calls.is_empty() {
                    return Err(AgentError::Llm(
                        "vendor signalled tool_calls with no calls".to_owned(),
                    ));
                }
                self.lock_history()
                    .push(ChatMessage::assistant_with_tool_calls(
                        String::new(),
                        calls.clone(),
                    ));

                // Side effects complete before the next segment is emitted.
                for call in calls {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    info!(name = %call.name, "dispatching model function call");
                    let result = self
                        .inner
                        .functions
                        .dispatch(&call.name, &call.arguments)
                        .await;
                    self.lock_history()
                        .push(ChatMessage::tool_result(call.call_id, result.to_string()));
                }
                continue;
            }

            // Clean finish: flush the remainder as the terminal segment.
            let remainder = splitter.finish();
            if !remainder.is_empty() {
                self.emit_segment(turn_id, &mut next_index, remainder, true, interaction_count)
                    .await?;
            }
            let text = assistant_text.trim();
            if !text.is_empty() {
                self.lock_history().push(ChatMessage::assistant(text));
            }
            debug!(turn_id, segments = next_index, "LLM turn streamed to completion");
            return Ok(());
        }
    }

    async fn emit_segment(
        &self,
        turn_id: u64,
        next_index: &mut u32,
        text: String,
        is_final: bool,
        interaction_count: u32,
    ) -> Result<()> {
        if !self.is_current(turn_id) {
            return Err(AgentError::Cancelled);
        }
        let segment = ReplySegment {
            turn_id,
            index: *next_index,
            text,
            is_final,
            interaction_count,
        };
        *next_index += 1;
        self.inner
            .events
            .send(LlmTurnEvent::Segment(segment))
            .await
            .map_err(|_| AgentError::Channel("LLM event receiver dropped".to_owned()))
    }

    fn is_current(&self, turn_id: u64) -> bool {
        self.lock_active()
            .as_ref()
            .map(|turn| turn.id == turn_id)
            .unwrap_or(false)
    }

    /// Clear the active slot when this turn still owns it. Returns whether
    /// the turn was current (stale turns must stay silent).
    fn finish_if_current(&self, turn_id: u64) -> bool {
        let mut active = self.lock_active();
        match active.as_ref() {
            Some(turn) if turn.id == turn_id => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// Post-call structured emotional analysis (0–10 scalars).
    ///
    /// Runs detached from the live call; retried on transient failures.
    ///
    /// # Errors
    ///
    /// Returns an error once retries are exhausted or the vendor returns a
    /// payload that does not match the schema.
    pub async fn analyze_emotions(&self, messages: &[JournalMessage]) -> Result<EmotionalMetrics> {
        let transcript: String = messages
            .iter()
            .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
            .collect();

        let body = json!({
            "model": self.inner.config.model,
            "stream": false,
            "messages": [
                {
                    "role": "system",
                    "content": "You assess the emotional state of an elderly caller with \
                        dementia from a call transcript. Score anxiety, agitation, \
                        confusion, and comfort on a 0-10 scale. Respond with JSON only."
                },
                {"role": "user", "content": transcript}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "emotional_metrics",
                    "schema": {
                        "type": "object",
                        "properties": {
                            "anxiety": {"type": "number", "minimum": 0, "maximum": 10},
                            "agitation": {"type": "number", "minimum": 0, "maximum": 10},
                            "confusion": {"type": "number", "minimum": 0, "maximum": 10},
                            "comfort": {"type": "number", "minimum": 0, "maximum": 10},
                            "mentions_pain": {"type": "boolean"},
                            "mentions_medication": {"type": "boolean"},
                            "mentions_family": {"type": "boolean"}
                        },
                        "required": ["anxiety", "agitation", "confusion", "comfort"]
                    }
                }
            }
        });
        let url = chat_completions_url(&self.inner.config.endpoint);

        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let metrics = policy
            .run(&cancel, |_attempt| {
                let client = self.inner.client.clone();
                let url = url.clone();
                let body = body.clone();
                let key = self.inner.config.api_key.clone();
                async move {
                    let response = client
                        .post(&url)
                        .bearer_auth(&key)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| {
                            Classified::retryable(AgentError::Llm(format!("request failed: {e}")))
                        })?;

                    let status = response.status().as_u16();
                    if status != 200 {
                        let text = response.text().await.unwrap_or_default();
                        return Err(Classified {
                            error: map_http_error(status, &text),
                            class: classify_status(status),
                        });
                    }

                    let value: Value = response.json().await.map_err(|e| {
                        Classified::retryable(AgentError::Llm(format!("bad body: {e}")))
                    })?;
                    let content = value["choices"][0]["message"]["content"]
                        .as_str()
                        .unwrap_or("");
                    serde_json::from_str::<EmotionalMetrics>(content).map_err(|e| {
                        Classified::fatal(AgentError::Llm(format!(
                            "metrics did not match schema: {e}"
                        )))
                    })
                }
            })
            .await
            .map_err(|e| {
                e.into_inner()
                    .unwrap_or(AgentError::Llm("analysis cancelled".to_owned()))
            })?;

        Ok(metrics.clamped())
    }
}

/// Model-backed memory keying helper.
///
/// Implements the store's [`KeyGenerator`] seam so key derivation can use
/// the model without the memory store depending on the turn adapter. Any
/// failure returns `None` and the store falls back to deterministic
/// derivation.
pub struct KeyHelper {
    config: LlmConfig,
    client: reqwest::Client,
}

impl KeyHelper {
    /// New helper over the same vendor settings as the turn adapter.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl KeyGenerator for KeyHelper {
    async fn suggest_key(&self, content: &str) -> Option<String> {
        let body = json!({
            "model": self.config.model,
            "stream": false,
            "max_tokens": 20,
            "messages": [
                {
                    "role": "system",
                    "content": "Produce a short kebab-case key (2-5 words) naming this \
                        memory. Reply with the key only."
                },
                {"role": "user", "content": content}
            ]
        });
        let url = chat_completions_url(&self.config.endpoint);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(std::time::Duration::from_secs(5))
            .json(&body)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let value: Value = response.json().await.ok()?;
        let key = value["choices"][0]["message"]["content"].as_str()?.trim();
        if key.is_empty() { None } else { Some(key.to_owned()) }
    }
}

// ── Wire helpers ──────────────────────────────────────────────

fn chat_completions_url(endpoint: &str) -> String {
    format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'))
}

/// Build the chat-completions request body.
pub(crate) fn build_completion_body(
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    max_tokens: u32,
    stream: bool,
) -> Value {
    let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();
    let mut body = json!({
        "model": model,
        "messages": wire_messages,
        "stream": stream,
        "max_tokens": max_tokens,
    });
    if !tools.is_empty()
        && let Some(obj) = body.as_object_mut()
    {
        let tools_json: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        obj.insert("tools".into(), json!(tools_json));
    }
    body
}

fn message_to_wire(message: &ChatMessage) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        _ => {
            let mut obj = json!({
                "role": message.role.as_str(),
                "content": message.content,
            });
            if !message.tool_calls.is_empty()
                && let Some(map) = obj.as_object_mut()
            {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.call_id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments}
                        })
                    })
                    .collect();
                map.insert("tool_calls".into(), json!(calls));
            }
            obj
        }
    }
}

fn map_http_error(status: u16, body: &str) -> AgentError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned());
    AgentError::Llm(format!("HTTP {status}: {message}"))
}

// ── Segmentation ──────────────────────────────────────────────

/// Splits streamed assistant text on the segment delimiter.
#[derive(Debug)]
struct SegmentSplitter {
    delimiter: char,
    buffer: String,
}

impl SegmentSplitter {
    fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            buffer: String::new(),
        }
    }

    /// Absorb a text delta, returning any segments it completed.
    fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut segments = Vec::new();
        while let Some(pos) = self.buffer.find(self.delimiter) {
            let segment = self.buffer[..pos].trim().to_owned();
            self.buffer.drain(..pos + self.delimiter.len_utf8());
            if !segment.is_empty() {
                segments.push(segment);
            }
        }
        segments
    }

    /// Flush the remainder after the last delimiter.
    fn finish(&mut self) -> String {
        std::mem::take(&mut self.buffer).trim().to_owned()
    }
}

impl LlmAdapter {
    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTurn>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
