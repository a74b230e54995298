//! Fixed function registry exposed to the language model.
//!
//! Each tool carries a JSON-shaped schema sent with the completion request;
//! dispatch runs the side effect to completion before the turn's next
//! segment flows to synthesis. Fact-protected memory operations surface a
//! structured `{success: false, reason: "protected"}` payload rather than
//! an error, so the model can explain itself to the caller.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::memory::{MemoryCategory, MemoryStore, RemoveOutcome, SaveAction, UpdateOutcome};

/// Default RSS source for `get_news`.
const DEFAULT_NEWS_URL: &str = "https://feeds.bbci.co.uk/news/rss.xml";

/// Maximum headlines returned by `get_news`.
const MAX_HEADLINES: usize = 5;

/// One tool binding sent to the vendor.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Function name.
    pub name: &'static str,
    /// Model-facing description.
    pub description: &'static str,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}

/// A request from the model to hand the call to a human.
///
/// Delivery is deferred: the orchestrator waits for in-flight playback to
/// drain before acting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Model-stated reason for the handoff.
    pub reason: String,
}

/// The fixed set of tool bindings.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "remember",
            description: "Save something the caller shared so future calls can bring it up.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "What to remember"},
                    "category": {
                        "type": "string",
                        "enum": ["family", "health", "preferences", "topics_to_avoid", "general"]
                    }
                },
                "required": ["content"]
            }),
        },
        ToolDefinition {
            name: "recall",
            description: "Look up a saved memory by its key.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Memory key to look up"}
                },
                "required": ["key"]
            }),
        },
        ToolDefinition {
            name: "forget",
            description: "Delete a saved memory by its key. Protected facts cannot be deleted.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string", "description": "Memory key to delete"}
                },
                "required": ["key"]
            }),
        },
        ToolDefinition {
            name: "update_memory",
            description: "Replace the content of a saved memory.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": {"type": "string"},
                    "new_content": {"type": "string"},
                    "category": {
                        "type": "string",
                        "enum": ["family", "health", "preferences", "topics_to_avoid", "general"]
                    }
                },
                "required": ["key", "new_content"]
            }),
        },
        ToolDefinition {
            name: "transfer_call",
            description: "Transfer the call to a family member once current audio finishes.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why the handoff is needed"}
                },
                "required": ["reason"]
            }),
        },
        ToolDefinition {
            name: "get_news",
            description: "Fetch a few current news headlines to chat about.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "category": {"type": "string", "description": "News category, e.g. world"}
                }
            }),
        },
    ]
}

/// Registry wiring tool names to their side effects.
pub struct FunctionRegistry {
    memory: MemoryStore,
    client: reqwest::Client,
    news_url: String,
    transfer_tx: mpsc::UnboundedSender<TransferRequest>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("news_url", &self.news_url)
            .finish_non_exhaustive()
    }
}

impl FunctionRegistry {
    /// New registry over the shared memory store.
    ///
    /// Transfer requests are forwarded on `transfer_tx` for the
    /// orchestrator's deferred handling.
    pub fn new(memory: MemoryStore, transfer_tx: mpsc::UnboundedSender<TransferRequest>) -> Self {
        Self {
            memory,
            client: reqwest::Client::new(),
            news_url: DEFAULT_NEWS_URL.to_owned(),
            transfer_tx,
        }
    }

    /// Override the RSS source (tests, regional feeds).
    #[must_use]
    pub fn with_news_url(mut self, url: impl Into<String>) -> Self {
        self.news_url = url.into();
        self
    }

    /// Dispatch one tool invocation and return its JSON result payload.
    ///
    /// Never fails: argument and execution problems come back as
    /// `{success: false, reason}` so the model can react in-turn.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> Value {
        let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
        debug!(name, "dispatching function call");

        match name {
            "remember" => self.remember(&args).await,
            "recall" => self.recall(&args),
            "forget" => self.forget(&args),
            "update_memory" => self.update_memory(&args),
            "transfer_call" => self.transfer_call(&args),
            "get_news" => self.get_news().await,
            _ => {
                warn!(name, "unknown function requested by model");
                json!({"success": false, "reason": "unknown_function"})
            }
        }
    }

    async fn remember(&self, args: &Value) -> Value {
        let Some(content) = args["content"].as_str().filter(|c| !c.trim().is_empty()) else {
            return json!({"success": false, "reason": "missing_content"});
        };
        let category = args["category"]
            .as_str()
            .map(MemoryCategory::parse)
            .unwrap_or(MemoryCategory::General);

        match self.memory.save(None, content, category, false).await {
            Ok(outcome) => json!({
                "success": true,
                "key": outcome.key,
                "action": match outcome.action {
                    SaveAction::Created => "created",
                    SaveAction::Updated => "updated",
                },
            }),
            Err(e) => {
                warn!(error = %e, "remember failed");
                json!({"success": false, "reason": "storage_error"})
            }
        }
    }

    fn recall(&self, args: &Value) -> Value {
        let Some(key) = args["key"].as_str() else {
            return json!({"success": false, "reason": "missing_key"});
        };
        match self.memory.get(key) {
            Ok(Some(record)) => json!({
                "success": true,
                "key": record.key,
                "content": record.content,
                "category": record.category.as_str(),
            }),
            Ok(None) => json!({"success": false, "reason": "not_found"}),
            Err(e) => {
                warn!(error = %e, "recall failed");
                json!({"success": false, "reason": "storage_error"})
            }
        }
    }

    fn forget(&self, args: &Value) -> Value {
        let Some(key) = args["key"].as_str() else {
            return json!({"success": false, "reason": "missing_key"});
        };
        match self.memory.remove(key, false) {
            Ok(RemoveOutcome::Removed) => json!({"success": true}),
            Ok(RemoveOutcome::NotFound) => json!({"success": false, "reason": "not_found"}),
            Ok(RemoveOutcome::Protected) => json!({"success": false, "reason": "protected"}),
            Err(e) => {
                warn!(error = %e, "forget failed");
                json!({"success": false, "reason": "storage_error"})
            }
        }
    }

    fn update_memory(&self, args: &Value) -> Value {
        let Some(key) = args["key"].as_str() else {
            return json!({"success": false, "reason": "missing_key"});
        };
        let Some(content) = args["new_content"].as_str() else {
            return json!({"success": false, "reason": "missing_content"});
        };
        let category = args["category"].as_str().map(MemoryCategory::parse);

        match self.memory.update(key, content, category, false) {
            Ok(UpdateOutcome::Updated) => json!({"success": true}),
            Ok(UpdateOutcome::NotFound) => json!({"success": false, "reason": "not_found"}),
            Ok(UpdateOutcome::Protected) => json!({"success": false, "reason": "protected"}),
            Err(e) => {
                warn!(error = %e, "update_memory failed");
                json!({"success": false, "reason": "storage_error"})
            }
        }
    }

    fn transfer_call(&self, args: &Value) -> Value {
        let reason = args["reason"].as_str().unwrap_or("caller request").to_owned();
        match self.transfer_tx.send(TransferRequest { reason }) {
            Ok(()) => json!({"success": true, "status": "transfer_pending"}),
            Err(_) => json!({"success": false, "reason": "transfer_unavailable"}),
        }
    }

    async fn get_news(&self) -> Value {
        let response = match self.client.get(&self.news_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "news fetch failed");
                return json!({"success": false, "reason": "fetch_error"});
            }
            Err(e) => {
                warn!(error = %e, "news fetch failed");
                return json!({"success": false, "reason": "fetch_error"});
            }
        };
        let body = response.text().await.unwrap_or_default();
        let headlines = extract_titles(&body, MAX_HEADLINES);
        if headlines.is_empty() {
            json!({"success": false, "reason": "no_headlines"})
        } else {
            json!({"success": true, "headlines": headlines})
        }
    }
}

/// Pull item titles out of an RSS document.
///
/// Scans for `<title>` elements, unwrapping CDATA, and skips the first
/// match (the channel's own title).
fn extract_titles(xml: &str, limit: usize) -> Vec<String> {
    let mut titles = Vec::new();
    let mut rest = xml;
    while let Some(open) = rest.find("<title>") {
        let after = &rest[open + "<title>".len()..];
        let Some(close) = after.find("</title>") else {
            break;
        };
        let raw = after[..close].trim();
        let title = raw
            .strip_prefix("<![CDATA[")
            .and_then(|s| s.strip_suffix("]]>"))
            .unwrap_or(raw)
            .trim();
        if !title.is_empty() {
            titles.push(title.to_owned());
        }
        rest = &after[close + "</title>".len()..];
        if titles.len() > limit {
            break;
        }
    }
    // The first <title> is the channel name, not a headline.
    if !titles.is_empty() {
        titles.remove(0);
    }
    titles.truncate(limit);
    titles
}
