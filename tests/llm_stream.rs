//! LLM adapter contract tests.
//!
//! Verify streaming segmentation, in-turn function dispatch, fact
//! protection surfacing, and turn cancellation against a mock vendor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use wren::config::LlmConfig;
use wren::db::Database;
use wren::journal::{JournalMessage, MessageRole};
use wren::llm::functions::FunctionRegistry;
use wren::llm::{LlmAdapter, LlmTurnEvent};
use wren::memory::{MemoryCategory, MemoryStore};

/// Matches requests whose body contains the given substring.
struct BodyContains(&'static str);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

/// Matches requests whose body lacks the given substring.
struct BodyLacks(&'static str);

impl Match for BodyLacks {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

fn sse_text_reply(text: &str) -> String {
    let chunk = serde_json::json!({
        "choices": [{"delta": {"content": text}, "index": 0}]
    });
    let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop","index":0}]}"#;
    format!("data: {chunk}\n\ndata: {finish}\n\ndata: [DONE]\n\n")
}

fn test_store() -> MemoryStore {
    let db = Arc::new(Database::open_in_memory().expect("open db"));
    MemoryStore::new(db).expect("store")
}

fn adapter_for(
    server: &MockServer,
    memory: MemoryStore,
) -> (LlmAdapter, mpsc::Receiver<LlmTurnEvent>) {
    let (events_tx, events_rx) = mpsc::channel(32);
    let (transfer_tx, _transfer_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(FunctionRegistry::new(memory, transfer_tx));
    let config = LlmConfig {
        api_key: "test-key".to_owned(),
        endpoint: server.uri(),
        ..LlmConfig::default()
    };
    (LlmAdapter::new(config, registry, events_tx), events_rx)
}

async fn collect_turn(events_rx: &mut mpsc::Receiver<LlmTurnEvent>) -> Vec<LlmTurnEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("turn event within deadline")
            .expect("event channel open");
        let terminal = matches!(
            event,
            LlmTurnEvent::Completed { .. } | LlmTurnEvent::Failed { .. }
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn streamed_reply_is_segmented_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_text_reply("Hi there!\u{2022}I'm doing well.")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (adapter, mut events_rx) = adapter_for(&server, test_store());
    adapter.set_system_prompt("persona");
    let turn_id = adapter.completion("Hello, how are you?", 1);

    let events = collect_turn(&mut events_rx).await;
    let segments: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LlmTurnEvent::Segment(s) => Some(s),
            _ => None,
        })
        .collect();

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].index, 0);
    assert_eq!(segments[0].text, "Hi there!");
    assert!(!segments[0].is_final);
    assert_eq!(segments[1].index, 1);
    assert_eq!(segments[1].text, "I'm doing well.");
    assert!(segments[1].is_final);
    assert!(segments.iter().all(|s| s.turn_id == turn_id));
    assert!(segments.iter().all(|s| s.interaction_count == 1));

    assert!(matches!(
        events.last(),
        Some(LlmTurnEvent::Completed { turn_id: t }) if *t == turn_id
    ));

    // The history carries the exchange for the next turn.
    let history = adapter.history();
    assert!(history.iter().any(|m| m.content.contains("Hello, how are you?")));
    assert!(history.iter().any(|m| m.content.contains("I'm doing well.")));
}

#[tokio::test]
async fn protected_fact_survives_a_forget_call() {
    let server = MockServer::start().await;

    // First round: the model asks to forget a protected fact.
    let tool_sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",",
        "\"function\":{\"name\":\"forget\",\"arguments\":\"\"}}]},\"index\":0}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":",
        "{\"arguments\":\"{\\\"key\\\":\\\"daughter-name-sarah\\\"}\"}}]},\"index\":0}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\",\"index\":0}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(BodyLacks("\"role\":\"tool\""))
        .respond_with(ResponseTemplate::new(200).set_body_string(tool_sse))
        .expect(1)
        .mount(&server)
        .await;

    // Second round: the tool result is in context and the model explains.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(BodyContains("\"role\":\"tool\""))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_text_reply(
            "I can't let that one go, dear.\u{2022}It's important to me.",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let memory = test_store();
    memory
        .save(
            Some("daughter-name-sarah"),
            "Daughter is named Sarah",
            MemoryCategory::Family,
            true,
        )
        .await
        .expect("seed fact");

    let (adapter, mut events_rx) = adapter_for(&server, memory.clone());
    adapter.completion("Forget that my daughter is named Sarah.", 2);
    let events = collect_turn(&mut events_rx).await;

    // The continuation was spoken, segmented as usual.
    let segments: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LlmTurnEvent::Segment(s) => Some(s.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        segments,
        vec!["I can't let that one go, dear.", "It's important to me."]
    );

    // The tool message carried the structured protected payload.
    let requests = server.received_requests().await.expect("recorded requests");
    let second_body = String::from_utf8_lossy(&requests[1].body).to_string();
    assert!(second_body.contains("\"protected\""));
    assert!(second_body.contains("\"success\":false"));

    // And the record is untouched.
    let record = memory
        .get("daughter-name-sarah")
        .expect("get")
        .expect("record");
    assert_eq!(record.content, "Daughter is named Sarah");
    assert!(record.is_fact);
}

#[tokio::test]
async fn cancelled_turn_emits_nothing_after_cancel() {
    let server = MockServer::start().await;
    // Slow response: cancellation lands while the request is in flight.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_text_reply("Too late\u{2022}to speak."))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (adapter, mut events_rx) = adapter_for(&server, test_store());
    adapter.completion("Tell me a story", 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.cancel();

    // No segment, completion, or failure may surface for the dead turn.
    let quiet =
        tokio::time::timeout(Duration::from_millis(600), events_rx.recv()).await;
    assert!(quiet.is_err(), "cancelled turn leaked an event: {quiet:?}");
}

#[tokio::test]
async fn new_turn_supersedes_the_active_one() {
    let server = MockServer::start().await;
    // The superseding turn's request carries the whole history, so the
    // first mock must exclude it explicitly.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(BodyContains("first question"))
        .and(BodyLacks("second question"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_text_reply("stale answer"))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(BodyContains("second question"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_text_reply("fresh answer")))
        .mount(&server)
        .await;

    let (adapter, mut events_rx) = adapter_for(&server, test_store());
    let first = adapter.completion("first question", 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = adapter.completion("second question", 2);
    assert_ne!(first, second);

    let events = collect_turn(&mut events_rx).await;
    // Only the superseding turn's events surface.
    for event in &events {
        match event {
            LlmTurnEvent::Segment(s) => {
                assert_eq!(s.turn_id, second);
                assert_eq!(s.text, "fresh answer");
            }
            LlmTurnEvent::Completed { turn_id } => assert_eq!(*turn_id, second),
            LlmTurnEvent::Failed { .. } => unreachable!("unexpected failure: {event:?}"),
        }
    }
}

#[tokio::test]
async fn vendor_error_fails_the_turn_without_segments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (adapter, mut events_rx) = adapter_for(&server, test_store());
    let turn_id = adapter.completion("hello", 1);

    let events = collect_turn(&mut events_rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        LlmTurnEvent::Failed { turn_id: t, .. } if *t == turn_id
    ));
}

#[tokio::test]
async fn emotional_analysis_parses_structured_output() {
    let server = MockServer::start().await;
    let content = r#"{"anxiety": 12.0, "agitation": 1.5, "confusion": 3.0, "comfort": 8.0, "mentions_family": true}"#;
    let body = serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    });
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(BodyContains("json_schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let (adapter, _events_rx) = adapter_for(&server, test_store());
    let messages = vec![
        JournalMessage {
            role: MessageRole::User,
            content: "I miss my family".to_owned(),
            timestamp: chrono::Utc::now(),
        },
        JournalMessage {
            role: MessageRole::Assistant,
            content: "They love you very much.".to_owned(),
            timestamp: chrono::Utc::now(),
        },
    ];

    let metrics = adapter.analyze_emotions(&messages).await.expect("metrics");
    // Scalars are clamped into the documented 0-10 scale.
    assert_eq!(metrics.anxiety, 10.0);
    assert_eq!(metrics.comfort, 8.0);
    assert!(metrics.mentions_family);
    assert!(!metrics.mentions_pain);
}
