//! TTS worker contract tests.
//!
//! Verify ordered emission, rate-limit handling with breaker trip and
//! recovery, and clear-on-interruption suppression against a mock vendor.

use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wren::breaker::BreakerEvent;
use wren::config::TtsConfig;
use wren::tts::{ClearReason, TtsAdapter, TtsEvent, TtsSegment};

fn config_for(server: &MockServer) -> TtsConfig {
    TtsConfig {
        api_key: "tts-key".to_owned(),
        endpoint: server.uri(),
        breaker_threshold: 3,
        breaker_recovery_ms: 300,
        request_timeout: Duration::from_secs(2),
        ..TtsConfig::default()
    }
}

fn segment(index: u32, text: &str) -> TtsSegment {
    TtsSegment {
        index,
        text: text.to_owned(),
        interaction_count: 1,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<TtsEvent>, deadline: Duration) -> TtsEvent {
    tokio::time::timeout(deadline, rx.recv())
        .await
        .expect("TTS event within deadline")
        .expect("TTS event channel open")
}

#[tokio::test]
async fn speech_events_preserve_submission_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x7f\x7f\x7f".to_vec()))
        .expect(3)
        .mount(&server)
        .await;

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let adapter = TtsAdapter::spawn(
        config_for(&server),
        Duration::from_millis(5),
        events_tx,
        None,
    );

    adapter.generate(segment(0, "Hi there!"));
    adapter.generate(segment(1, "I'm doing well."));
    adapter.generate(segment(2, "And you?"));

    let mut indices = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events_rx, Duration::from_secs(5)).await {
            TtsEvent::Speech { index, audio, .. } => {
                assert_eq!(&audio[..], b"\x7f\x7f\x7f");
                indices.push(index);
            }
            other => unreachable!("expected speech, got {other:?}"),
        }
    }
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn rate_limits_trip_the_breaker_and_drain_the_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (breaker_tx, mut breaker_rx) = mpsc::unbounded_channel();
    let mut config = config_for(&server);
    config.breaker_recovery_ms = 60_000;
    let adapter = TtsAdapter::spawn(
        config,
        Duration::from_millis(5),
        events_tx,
        Some(breaker_tx),
    );

    // Three vendor 429s (one dispatch, three attempts) trip the breaker.
    adapter.generate(segment(0, "will never be spoken"));

    let tripped = tokio::time::timeout(Duration::from_secs(10), breaker_rx.recv())
        .await
        .expect("breaker event within deadline")
        .expect("breaker channel open");
    assert_eq!(tripped, BreakerEvent::Tripped { failures: 3 });

    let request_count = server.received_requests().await.expect("requests").len();
    assert_eq!(request_count, 3);

    // While OPEN, a new generate drains without touching the network.
    adapter.generate(segment(1, "also never spoken"));
    let cleared = loop {
        match next_event(&mut events_rx, Duration::from_secs(5)).await {
            TtsEvent::QueueCleared {
                reason: ClearReason::BreakerOpen,
                ..
            } => break true,
            TtsEvent::QueueCleared { .. } => continue,
            other => unreachable!("expected queue_cleared, got {other:?}"),
        }
    };
    assert!(cleared);
    assert_eq!(
        server.received_requests().await.expect("requests").len(),
        request_count,
        "short-circuited generate must not reach the vendor"
    );
}

#[tokio::test]
async fn breaker_recovers_through_a_probe() {
    let server = MockServer::start().await;
    // First three attempts rate-limit, everything after succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (breaker_tx, mut breaker_rx) = mpsc::unbounded_channel();
    let adapter = TtsAdapter::spawn(
        config_for(&server),
        Duration::from_millis(5),
        events_tx,
        Some(breaker_tx),
    );

    adapter.generate(segment(0, "trips the breaker"));
    let tripped = tokio::time::timeout(Duration::from_secs(10), breaker_rx.recv())
        .await
        .expect("trip within deadline")
        .expect("breaker channel open");
    assert!(matches!(tripped, BreakerEvent::Tripped { .. }));

    // After the recovery window, the next generate is the single probe.
    tokio::time::sleep(Duration::from_millis(400)).await;
    adapter.generate(segment(1, "the probe"));

    let mut saw_probing = false;
    let mut saw_recovered = false;
    while !(saw_probing && saw_recovered) {
        let event = tokio::time::timeout(Duration::from_secs(5), breaker_rx.recv())
            .await
            .expect("breaker event within deadline")
            .expect("breaker channel open");
        match event {
            BreakerEvent::Probing => saw_probing = true,
            BreakerEvent::Recovered => saw_recovered = true,
            other => unreachable!("unexpected transition {other:?}"),
        }
    }

    // The probe's audio is emitted normally.
    loop {
        match next_event(&mut events_rx, Duration::from_secs(5)).await {
            TtsEvent::Speech { index, .. } => {
                assert_eq!(index, 1);
                break;
            }
            TtsEvent::QueueCleared { .. } => continue,
        }
    }
}

#[tokio::test]
async fn clear_suppresses_in_flight_synthesis() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow audio".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let adapter = TtsAdapter::spawn(
        config_for(&server),
        Duration::from_millis(5),
        events_tx,
        None,
    );

    adapter.generate(segment(0, "being synthesized"));
    adapter.generate(segment(1, "queued behind it"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.clear(ClearReason::Interruption);

    // The queue drain is announced; no speech may follow it.
    let mut saw_cleared = false;
    loop {
        match tokio::time::timeout(Duration::from_millis(800), events_rx.recv()).await {
            Ok(Some(TtsEvent::QueueCleared {
                reason: ClearReason::Interruption,
                ..
            })) => saw_cleared = true,
            Ok(Some(TtsEvent::Speech { .. })) => {
                unreachable!("speech emitted after clear")
            }
            Ok(Some(TtsEvent::QueueCleared { .. })) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    assert!(saw_cleared);

    // A later generate restarts the worker normally.
    adapter.generate(segment(0, "fresh turn"));
    loop {
        match next_event(&mut events_rx, Duration::from_secs(5)).await {
            TtsEvent::Speech { index, text, .. } => {
                assert_eq!(index, 0);
                assert_eq!(text, "fresh turn");
                break;
            }
            TtsEvent::QueueCleared { .. } => continue,
        }
    }
}
