//! Streaming speech-to-text adapter.
//!
//! Owns a websocket to the STT vendor and exposes two things to the rest
//! of the pipeline: a sink for raw μ-law audio frames and an event stream
//! with interim `Utterance` events and exactly one final `Transcription`
//! per user turn.
//!
//! The connection lives in its own task and moves through
//! `Connecting → Open → (Degraded → Reconnecting)* → Closed`. While not
//! open, incoming audio is buffered (bounded, drop-oldest) and flushed in
//! order once the socket opens. Reconnection backs off exponentially and
//! stops either at the configured attempt cap or on intentional close.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SttConfig;
use crate::error::{AgentError, Result};

/// Cap on audio frames buffered while the socket is not open.
const FRAME_BUFFER_CAP: usize = 50;

/// Events emitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Interim, non-final recognition of the current speech.
    Utterance {
        /// Partial text, repeated and growing as the caller talks.
        text: String,
    },
    /// Finalized text for one user turn. Emitted exactly once per turn.
    Transcription {
        /// Final text.
        text: String,
    },
    /// The vendor connection dropped.
    Disconnected {
        /// `true` once reconnection attempts are exhausted.
        fatal: bool,
    },
}

enum SttCommand {
    Audio(Bytes),
    ClearBuffers,
    Close,
}

/// Handle to the STT connection task.
pub struct SttAdapter {
    cmd_tx: mpsc::UnboundedSender<SttCommand>,
}

impl SttAdapter {
    /// Spawn the connection task and return its handle.
    ///
    /// Recognition events arrive on `events`; the task ends when `close`
    /// is called, the handle is dropped, or reconnection gives up.
    pub fn spawn(config: SttConfig, events: mpsc::Sender<SttEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_stt(config, cmd_rx, events));
        Self { cmd_tx }
    }

    /// Feed one raw μ-law audio frame to the recognizer.
    pub fn send_audio(&self, frame: Bytes) {
        let _ = self.cmd_tx.send(SttCommand::Audio(frame));
    }

    /// Drop accumulated partial text and pending frames. Called on
    /// interruption.
    pub fn clear_buffers(&self) {
        let _ = self.cmd_tx.send(SttCommand::ClearBuffers);
    }

    /// Intentionally close the connection; suppresses reconnection.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(SttCommand::Close);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Open,
    Degraded,
    Reconnecting,
    Closed,
}

fn transition(state: &mut ConnState, next: ConnState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "STT connection state");
        *state = next;
    }
}

/// Resolves the vendor's interim/final flags into turn-level events.
///
/// `is_final` results accumulate; `speech_final` flushes them as the
/// turn's transcription. If the vendor's `UtteranceEnd` arrives before a
/// `speech_final`, whatever has accumulated is flushed instead.
#[derive(Debug, Default)]
struct TranscriptAssembler {
    pending: String,
}

impl TranscriptAssembler {
    fn on_transcript(&mut self, text: &str, is_final: bool, speech_final: bool) -> Option<SttEvent> {
        if !is_final {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            return Some(SttEvent::Utterance {
                text: trimmed.to_owned(),
            });
        }

        if !text.trim().is_empty() {
            if !self.pending.is_empty() {
                self.pending.push(' ');
            }
            self.pending.push_str(text.trim());
        }

        if speech_final { self.flush() } else { None }
    }

    fn on_utterance_end(&mut self) -> Option<SttEvent> {
        self.flush()
    }

    fn flush(&mut self) -> Option<SttEvent> {
        if self.pending.trim().is_empty() {
            self.pending.clear();
            return None;
        }
        Some(SttEvent::Transcription {
            text: std::mem::take(&mut self.pending),
        })
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum VendorEvent {
    Transcript {
        text: String,
        is_final: bool,
        speech_final: bool,
    },
    UtteranceEnd,
    Error {
        message: String,
        rate_limited: bool,
    },
    Other,
}

/// Parse one vendor JSON frame, keyed on its `type` field.
fn parse_vendor_event(raw: &str) -> VendorEvent {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return VendorEvent::Error {
            message: "malformed vendor frame".to_owned(),
            rate_limited: false,
        };
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("Transcript") => {
            let text = value["channel"]["alternatives"][0]["transcript"]
                .as_str()
                .unwrap_or("")
                .to_owned();
            VendorEvent::Transcript {
                text,
                is_final: value["is_final"].as_bool().unwrap_or(false),
                speech_final: value["speech_final"].as_bool().unwrap_or(false),
            }
        }
        Some("UtteranceEnd") => VendorEvent::UtteranceEnd,
        Some("Error") => {
            let message = value["description"]
                .as_str()
                .or_else(|| value["message"].as_str())
                .unwrap_or("vendor error")
                .to_owned();
            let rate_limited = message.to_ascii_lowercase().contains("rate")
                || value["code"].as_u64() == Some(429);
            VendorEvent::Error {
                message,
                rate_limited,
            }
        }
        // Metadata, Open, Close, Warning, SpeechStarted.
        _ => VendorEvent::Other,
    }
}

/// Build the authorized websocket request for the vendor.
fn build_request(config: &SttConfig) -> Result<http::Request<()>> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| AgentError::Config(format!("bad STT endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("encoding", "mulaw")
        .append_pair("sample_rate", "8000")
        .append_pair("channels", "1")
        .append_pair("punctuate", "true")
        .append_pair("interim_results", "true")
        .append_pair("endpointing", &config.endpointing_ms.to_string())
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string());

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Stt(format!("bad STT request: {e}")))?;
    let auth = format!("Token {}", config.api_key)
        .parse()
        .map_err(|_| AgentError::Config("STT key contains invalid header bytes".to_owned()))?;
    request.headers_mut().insert(AUTHORIZATION, auth);
    Ok(request)
}

fn buffer_frame(buffer: &mut VecDeque<Bytes>, frame: Bytes) {
    if buffer.len() >= FRAME_BUFFER_CAP {
        buffer.pop_front();
    }
    buffer.push_back(frame);
}

async fn run_stt(
    config: SttConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<SttCommand>,
    events: mpsc::Sender<SttEvent>,
) {
    let mut buffer: VecDeque<Bytes> = VecDeque::new();
    let mut assembler = TranscriptAssembler::default();
    let mut state = ConnState::Connecting;
    let mut attempt: u32 = 0;

    'session: loop {
        if attempt > config.max_retries {
            warn!("STT reconnection attempts exhausted");
            let _ = events.send(SttEvent::Disconnected { fatal: true }).await;
            transition(&mut state, ConnState::Closed);
            break;
        }

        if attempt > 0 {
            transition(&mut state, ConnState::Reconnecting);
            let delay = reconnect_delay(&config, attempt);
            debug!(attempt, ?delay, "STT reconnect backoff");
            let mut sleep = std::pin::pin!(tokio::time::sleep(delay));
            // Keep buffering audio while we wait.
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SttCommand::Audio(frame)) => buffer_frame(&mut buffer, frame),
                        Some(SttCommand::ClearBuffers) => {
                            buffer.clear();
                            assembler.clear();
                        }
                        Some(SttCommand::Close) | None => {
                            transition(&mut state, ConnState::Closed);
                            break 'session;
                        }
                    },
                }
            }
        }

        let request = match build_request(&config) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "STT request construction failed");
                let _ = events.send(SttEvent::Disconnected { fatal: true }).await;
                break;
            }
        };

        info!(state = ?state, "connecting to STT vendor");
        let ws = match connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(error = %e, attempt, "STT connection failed");
                attempt += 1;
                continue;
            }
        };

        attempt = 0;
        transition(&mut state, ConnState::Open);
        info!("STT connection open");
        let (mut sink, mut stream) = ws.split();

        // Flush frames buffered while connecting, in order.
        while let Some(frame) = buffer.pop_front() {
            if let Err(e) = sink.send(WsMessage::Binary(frame.to_vec())).await {
                warn!(error = %e, "flush to STT failed");
                transition(&mut state, ConnState::Degraded);
                attempt = 1;
                continue 'session;
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SttCommand::Audio(frame)) => {
                        if let Err(e) = sink.send(WsMessage::Binary(frame.to_vec())).await {
                            warn!(error = %e, "STT send failed, reconnecting");
                            buffer_frame(&mut buffer, frame);
                            transition(&mut state, ConnState::Degraded);
                            attempt = 1;
                            continue 'session;
                        }
                    }
                    Some(SttCommand::ClearBuffers) => {
                        buffer.clear();
                        assembler.clear();
                    }
                    Some(SttCommand::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        transition(&mut state, ConnState::Closed);
                        break 'session;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(raw))) => {
                        match parse_vendor_event(&raw) {
                            VendorEvent::Transcript { text, is_final, speech_final } => {
                                if let Some(event) =
                                    assembler.on_transcript(&text, is_final, speech_final)
                                {
                                    let _ = events.send(event).await;
                                }
                            }
                            VendorEvent::UtteranceEnd => {
                                if let Some(event) = assembler.on_utterance_end() {
                                    let _ = events.send(event).await;
                                }
                            }
                            VendorEvent::Error { message, rate_limited } => {
                                warn!(message, rate_limited, "STT vendor error, reconnecting");
                                let _ = events.send(SttEvent::Disconnected { fatal: false }).await;
                                transition(&mut state, ConnState::Degraded);
                                attempt = 1;
                                continue 'session;
                            }
                            VendorEvent::Other => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("STT socket closed by vendor");
                        let _ = events.send(SttEvent::Disconnected { fatal: false }).await;
                        transition(&mut state, ConnState::Degraded);
                        attempt = 1;
                        continue 'session;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "STT socket error, reconnecting");
                        let _ = events.send(SttEvent::Disconnected { fatal: false }).await;
                        transition(&mut state, ConnState::Degraded);
                        attempt = 1;
                        continue 'session;
                    }
                },
            }
        }
    }

    debug!(state = ?state, "STT task finished");
}

fn reconnect_delay(config: &SttConfig, attempt: u32) -> std::time::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = config
        .initial_retry_delay_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_retry_delay_ms);
    std::time::Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── TranscriptAssembler ───────────────────────────────────

    #[test]
    fn interim_results_emit_utterances() {
        let mut assembler = TranscriptAssembler::default();
        let event = assembler.on_transcript("hello", false, false);
        assert_eq!(
            event,
            Some(SttEvent::Utterance {
                text: "hello".to_owned()
            })
        );
        // Nothing accumulates from interims.
        assert!(assembler.pending.is_empty());
    }

    #[test]
    fn speech_final_flushes_accumulated_finals() {
        let mut assembler = TranscriptAssembler::default();
        assert!(assembler.on_transcript("hello how", true, false).is_none());
        let event = assembler.on_transcript("are you?", true, true);
        assert_eq!(
            event,
            Some(SttEvent::Transcription {
                text: "hello how are you?".to_owned()
            })
        );
        // One transcription per turn: the pending buffer is drained.
        assert!(assembler.on_utterance_end().is_none());
    }

    #[test]
    fn utterance_end_flushes_when_speech_final_never_arrives() {
        let mut assembler = TranscriptAssembler::default();
        assert!(assembler.on_transcript("good night", true, false).is_none());
        let event = assembler.on_utterance_end();
        assert_eq!(
            event,
            Some(SttEvent::Transcription {
                text: "good night".to_owned()
            })
        );
    }

    #[test]
    fn empty_finals_are_ignored() {
        let mut assembler = TranscriptAssembler::default();
        assert!(assembler.on_transcript("", true, true).is_none());
        assert!(assembler.on_utterance_end().is_none());
        assert!(assembler.on_transcript("  ", false, false).is_none());
    }

    #[test]
    fn clear_drops_pending_text() {
        let mut assembler = TranscriptAssembler::default();
        let _ = assembler.on_transcript("half a", true, false);
        assembler.clear();
        assert!(assembler.on_utterance_end().is_none());
    }

    // ── Vendor frame parsing ──────────────────────────────────

    #[test]
    fn parses_transcript_frames() {
        let raw = r#"{
            "type": "Transcript",
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.98}]}
        }"#;
        assert_eq!(
            parse_vendor_event(raw),
            VendorEvent::Transcript {
                text: "hello there".to_owned(),
                is_final: true,
                speech_final: true,
            }
        );
    }

    #[test]
    fn parses_utterance_end_and_ignores_metadata() {
        assert_eq!(
            parse_vendor_event(r#"{"type":"UtteranceEnd","last_word_end":2.1}"#),
            VendorEvent::UtteranceEnd
        );
        assert_eq!(
            parse_vendor_event(r#"{"type":"Metadata","duration":12.0}"#),
            VendorEvent::Other
        );
        assert_eq!(parse_vendor_event(r#"{"type":"Warning"}"#), VendorEvent::Other);
    }

    #[test]
    fn rate_limit_errors_are_flagged() {
        let event = parse_vendor_event(r#"{"type":"Error","description":"Rate limit exceeded"}"#);
        assert_eq!(
            event,
            VendorEvent::Error {
                message: "Rate limit exceeded".to_owned(),
                rate_limited: true,
            }
        );
    }

    #[test]
    fn malformed_frames_become_errors() {
        assert!(matches!(
            parse_vendor_event("not json at all"),
            VendorEvent::Error { .. }
        ));
    }

    // ── Frame buffering ───────────────────────────────────────

    #[test]
    fn buffer_drops_oldest_at_capacity() {
        let mut buffer = VecDeque::new();
        for i in 0..(FRAME_BUFFER_CAP + 5) {
            buffer_frame(&mut buffer, Bytes::from(vec![i as u8]));
        }
        assert_eq!(buffer.len(), FRAME_BUFFER_CAP);
        // The five oldest frames were dropped.
        assert_eq!(buffer.front().map(|b| b[0]), Some(5));
        assert_eq!(
            buffer.back().map(|b| b[0]),
            Some((FRAME_BUFFER_CAP + 4) as u8)
        );
    }

    // ── Request construction ──────────────────────────────────

    #[test]
    fn request_carries_codec_and_auth() {
        let config = SttConfig {
            api_key: "dg-secret".to_owned(),
            ..SttConfig::default()
        };
        let request = build_request(&config).expect("request");
        let uri = request.uri().to_string();
        assert!(uri.contains("encoding=mulaw"));
        assert!(uri.contains("sample_rate=8000"));
        assert!(uri.contains("interim_results=true"));
        assert!(uri.contains("utterance_end_ms=1000"));
        let auth = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        assert_eq!(auth, Some("Token dg-secret"));
    }

    #[test]
    fn reconnect_delay_backs_off_and_caps() {
        let config = SttConfig {
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 8000,
            ..SttConfig::default()
        };
        assert_eq!(reconnect_delay(&config, 1).as_millis(), 500);
        assert_eq!(reconnect_delay(&config, 2).as_millis(), 1000);
        assert_eq!(reconnect_delay(&config, 4).as_millis(), 4000);
        assert_eq!(reconnect_delay(&config, 10).as_millis(), 8000);
    }
}
