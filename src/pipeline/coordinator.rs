//! Per-call orchestrator.
//!
//! One coordinator task per telephony connection. It owns the call's
//! adapters and runs a select loop over their event channels, translating
//! finalized transcriptions into ordered synthesis while honoring
//! barge-in: an interim utterance longer than five characters while
//! audio is still playing cancels the in-flight turn end to end (clear
//! frame → STT buffers → TTS queue → LLM stream) before any later
//! segment can reach synthesis.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::BreakerEvent;
use crate::config::AppConfig;
use crate::journal::{CallRecord, ConversationJournal};
use crate::llm::functions::{FunctionRegistry, TransferRequest};
use crate::llm::prompt::{PERSONA, build_system_prompt};
use crate::llm::{KeyHelper, LlmAdapter, LlmTurnEvent, ReplySegment};
use crate::memory::MemoryStore;
use crate::pipeline::analyzer::ConversationAnalyzer;
use crate::pipeline::messages::{BridgeInbound, CallSession, OutboundFrame};
use crate::stt::{SttAdapter, SttEvent};
use crate::telephony::StartMeta;
use crate::telephony::marks::MarkTracker;
use crate::tts::{ClearReason, TtsAdapter, TtsEvent, TtsSegment};

/// Channel capacities between the per-call tasks.
const STT_CHANNEL_SIZE: usize = 32;
const LLM_CHANNEL_SIZE: usize = 32;
const TTS_CHANNEL_SIZE: usize = 32;

/// Interim utterances longer than this trigger barge-in while audio is
/// outstanding.
const INTERRUPTION_MIN_CHARS: usize = 5;

/// Upper bound on waiting for playback to drain before a handoff.
const TRANSFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Greetings spoken on `start`, chosen at random.
const GREETINGS: &[&str] = &[
    "Hello there! It's so lovely to hear from you.",
    "Well hello! I was just thinking about you.",
    "Hello dear, how are you doing today?",
    "Hi there! I'm so glad you called.",
];

/// Spoken once when speech recognition is unrecoverable.
const APOLOGY: &str = "I'm so sorry, I'm having a little trouble hearing you right now.";

/// Process-wide handles injected into every call.
#[derive(Clone)]
pub struct CallDeps {
    /// Environment configuration.
    pub config: Arc<AppConfig>,
    /// Shared memory store.
    pub memory: MemoryStore,
    /// Shared conversation journal.
    pub journal: ConversationJournal,
}

/// Run one call to completion.
///
/// Constructed by the media bridge on the telephony `start` frame; returns
/// once the bridge reports `stop` or the socket closes, after persistence
/// has been kicked off. The post-close emotional analysis runs detached
/// and never delays this function's return.
pub async fn run_call(
    deps: CallDeps,
    meta: StartMeta,
    bridge_rx: mpsc::Receiver<BridgeInbound>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    marks: MarkTracker,
) {
    let session = CallSession::new(
        meta.call_sid.clone(),
        meta.stream_sid.clone(),
        deps.config.tts.voice_model.clone(),
    );
    info!(call_sid = %session.call_sid, stream_sid = %session.stream_sid, "call started");

    let (stt_tx, stt_rx) = mpsc::channel(STT_CHANNEL_SIZE);
    let (llm_tx, llm_rx) = mpsc::channel(LLM_CHANNEL_SIZE);
    let (tts_tx, tts_rx) = mpsc::channel(TTS_CHANNEL_SIZE);
    let (breaker_tx, breaker_rx) = mpsc::unbounded_channel();
    let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

    let stt = SttAdapter::spawn(deps.config.stt.clone(), stt_tx);
    let tts = TtsAdapter::spawn(
        deps.config.tts.clone(),
        deps.config.tts_baseline_spacing(),
        tts_tx,
        Some(breaker_tx),
    );

    // The llm keying helper is bound to this call's memory handle, so
    // `remember` without an explicit key asks the model first.
    let key_helper = Arc::new(KeyHelper::new(deps.config.llm.clone()));
    let keyed_memory = deps.memory.with_key_generator(key_helper);
    let registry = Arc::new(FunctionRegistry::new(keyed_memory, transfer_tx));
    let llm = LlmAdapter::new(deps.config.llm.clone(), registry, llm_tx);

    match deps.memory.list_keys() {
        Ok(keys) => llm.set_system_prompt(build_system_prompt(PERSONA, &keys)),
        Err(e) => {
            warn!(error = %e, "could not list memory keys, using bare persona");
            llm.set_system_prompt(PERSONA);
        }
    }

    let analyzer = ConversationAnalyzer::new(session.started_at);
    let mut coordinator = Coordinator {
        deps,
        session,
        analyzer,
        marks,
        stt,
        llm,
        tts,
        outbound_tx,
        interaction_count: 0,
        active_turn: None,
        stt_down: false,
        apology_spoken: false,
    };

    coordinator.speak_greeting();
    coordinator
        .run(bridge_rx, stt_rx, llm_rx, tts_rx, breaker_rx, transfer_rx)
        .await;
    coordinator.finalize().await;
}

struct Coordinator {
    deps: CallDeps,
    session: CallSession,
    analyzer: ConversationAnalyzer,
    marks: MarkTracker,
    stt: SttAdapter,
    llm: LlmAdapter,
    tts: TtsAdapter,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    interaction_count: u32,
    active_turn: Option<u64>,
    stt_down: bool,
    apology_spoken: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &mut self,
        mut bridge_rx: mpsc::Receiver<BridgeInbound>,
        mut stt_rx: mpsc::Receiver<SttEvent>,
        mut llm_rx: mpsc::Receiver<LlmTurnEvent>,
        mut tts_rx: mpsc::Receiver<TtsEvent>,
        mut breaker_rx: mpsc::UnboundedReceiver<BreakerEvent>,
        mut transfer_rx: mpsc::UnboundedReceiver<TransferRequest>,
    ) {
        loop {
            tokio::select! {
                inbound = bridge_rx.recv() => match inbound {
                    Some(BridgeInbound::Media(audio)) => {
                        // While STT is unrecoverable, caller audio is dropped.
                        if !self.stt_down {
                            self.stt.send_audio(audio);
                        }
                    }
                    Some(BridgeInbound::Mark(label)) => {
                        self.marks.remove(&label);
                    }
                    Some(BridgeInbound::Stop) | None => {
                        info!(call_sid = %self.session.call_sid, "stream stopped");
                        return;
                    }
                },
                event = stt_rx.recv() => match event {
                    Some(SttEvent::Utterance { text }) => self.on_utterance(&text),
                    Some(SttEvent::Transcription { text }) => self.on_transcription(&text),
                    Some(SttEvent::Disconnected { fatal }) => {
                        if fatal && !self.stt_down {
                            self.stt_down = true;
                            warn!("speech recognition is down for this call");
                            self.speak_apology();
                        }
                    }
                    None => return,
                },
                event = llm_rx.recv() => match event {
                    Some(LlmTurnEvent::Segment(segment)) => self.on_segment(segment),
                    Some(LlmTurnEvent::Completed { turn_id }) => {
                        if self.active_turn == Some(turn_id) {
                            debug!(turn_id, "turn complete");
                            self.active_turn = None;
                        }
                    }
                    Some(LlmTurnEvent::Failed { turn_id, message }) => {
                        warn!(turn_id, message, "turn failed mid-stream");
                        if self.active_turn == Some(turn_id) {
                            self.active_turn = None;
                            self.speak_apology();
                        }
                    }
                    None => return,
                },
                event = tts_rx.recv() => match event {
                    Some(TtsEvent::Speech { request_id, index, audio, text, .. }) => {
                        self.on_speech(request_id, index, audio, &text).await;
                    }
                    Some(TtsEvent::QueueCleared { reason, dropped }) => {
                        debug!(?reason, dropped, "synthesis queue cleared");
                    }
                    None => return,
                },
                event = breaker_rx.recv() => {
                    if let Some(event) = event {
                        info!(?event, "TTS breaker transition");
                    }
                },
                request = transfer_rx.recv() => {
                    if let Some(request) = request {
                        self.on_transfer(request);
                    }
                },
            }
        }
    }

    /// Interim speech: barge-in when the caller talks over playing audio.
    fn on_utterance(&mut self, text: &str) {
        if !should_interrupt(text, self.marks.len()) {
            return;
        }
        info!(call_sid = %self.session.call_sid, "caller barge-in");
        self.analyzer.record_interruption();

        // Cancellation propagates before any later segment can be queued:
        // the telephony buffer flushes, then local state is torn down.
        if self.outbound_tx.try_send(OutboundFrame::Clear).is_err() {
            warn!("could not queue clear frame");
        }
        self.marks.clear();
        self.stt.clear_buffers();
        self.tts.clear(ClearReason::Interruption);
        self.llm.cancel();
        self.active_turn = None;
    }

    /// Finalized transcription: start the next turn.
    fn on_transcription(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        debug!(call_sid = %self.session.call_sid, "transcription: {text}");
        self.analyzer.add_user_utterance(text);
        self.session.transcription_count += 1;
        self.interaction_count += 1;
        self.active_turn = Some(self.llm.completion(text, self.interaction_count));
    }

    /// Reply segment from the model: track it and queue synthesis.
    fn on_segment(&mut self, segment: ReplySegment) {
        if self.active_turn != Some(segment.turn_id) {
            debug!(turn_id = segment.turn_id, "discarding stale segment");
            return;
        }
        if !segment.text.is_empty() {
            self.analyzer.add_assistant_response(&segment.text);
        }
        self.tts.generate(TtsSegment {
            index: segment.index,
            text: segment.text,
            interaction_count: segment.interaction_count,
        });
    }

    /// Synthesized audio: hand it to the write loop with its mark label.
    async fn on_speech(&mut self, request_id: Uuid, index: u32, audio: bytes::Bytes, text: &str) {
        debug!(index, chars = text.len(), "speech ready");
        let label = mark_label(index, request_id);
        if self
            .outbound_tx
            .send(OutboundFrame::Audio { label, audio })
            .await
            .is_err()
        {
            warn!("telephony write loop is gone");
        }
    }

    /// Deferred human handoff: wait out playback, then direct the vendor.
    fn on_transfer(&mut self, request: TransferRequest) {
        let Some(number) = self.deps.config.transfer_number.clone() else {
            warn!("transfer requested but TRANSFER_NUMBER is not configured");
            return;
        };
        info!(reason = %request.reason, "transfer pending, draining playback");
        let marks = self.marks.clone();
        let outbound = self.outbound_tx.clone();
        tokio::spawn(async move {
            if !marks.wait_for_all(TRANSFER_DRAIN_TIMEOUT).await {
                warn!("transfer proceeding with playback still outstanding");
            }
            let _ = outbound
                .send(OutboundFrame::Handoff {
                    number,
                    reason: request.reason,
                })
                .await;
        });
    }

    fn speak_greeting(&mut self) {
        let greeting = GREETINGS[rand::thread_rng().gen_range(0..GREETINGS.len())];
        self.analyzer.add_assistant_response(greeting);
        self.llm.note_assistant_line(greeting);
        self.tts.generate(TtsSegment {
            index: 0,
            text: greeting.to_owned(),
            interaction_count: 0,
        });
    }

    /// One apology per call, spoken through the intact TTS path.
    fn speak_apology(&mut self) {
        if self.apology_spoken {
            return;
        }
        self.apology_spoken = true;
        self.analyzer.add_assistant_response(APOLOGY);
        self.llm.note_assistant_line(APOLOGY);
        self.tts.generate(TtsSegment {
            index: 0,
            text: APOLOGY.to_owned(),
            interaction_count: self.interaction_count,
        });
    }

    /// Close adapters, persist, and kick off the detached analysis.
    async fn finalize(&mut self) {
        let end_time = Utc::now();
        self.stt.close();
        self.llm.cancel();
        self.tts.clear(ClearReason::SessionEnd);
        self.marks.clear();

        let duration = end_time - self.session.started_at;
        let minimum = chrono::Duration::seconds(self.deps.config.minimum_call_duration_secs as i64);
        if duration < minimum {
            info!(
                call_sid = %self.session.call_sid,
                "call shorter than minimum duration, skipping persistence"
            );
            return;
        }

        let summary = self.analyzer.finalize(end_time);
        let record = CallRecord {
            call_sid: self.session.call_sid.clone(),
            stream_sid: Some(self.session.stream_sid.clone()),
            start_time: self.session.started_at,
            end_time,
            summary: serde_json::to_value(&summary).unwrap_or_default(),
            analytics: serde_json::json!({
                "topic_tags": summary.topic_tags,
                "care_indicators": summary.care_indicators,
            }),
        };

        let conversation_id = match self.deps.journal.save_summary(&record) {
            Ok(id) => id,
            Err(e) => {
                // Persistence errors never interrupt teardown.
                warn!(error = %e, "summary save failed, transcript is lost");
                return;
            }
        };

        let messages = self.analyzer.messages();
        if let Err(e) = self.deps.journal.save_messages(conversation_id, &messages) {
            warn!(error = %e, "message save failed; summary row is intact");
        }

        spawn_emotional_analysis(
            self.llm.clone(),
            self.deps.journal.clone(),
            conversation_id,
            messages,
        );
        info!(call_sid = %self.session.call_sid, conversation_id, "call persisted");
    }
}

/// Detached post-close analysis; holds no connection state, so a slow or
/// failing model call cannot delay teardown.
fn spawn_emotional_analysis(
    llm: LlmAdapter,
    journal: ConversationJournal,
    conversation_id: i64,
    messages: Vec<crate::journal::JournalMessage>,
) {
    tokio::spawn(async move {
        match llm.analyze_emotions(&messages).await {
            Ok(metrics) => {
                if let Err(e) = journal.save_emotional_metrics(conversation_id, &metrics) {
                    warn!(conversation_id, error = %e, "emotional metrics save failed");
                } else {
                    debug!(conversation_id, "emotional metrics persisted");
                }
            }
            Err(e) => warn!(conversation_id, error = %e, "emotional analysis failed"),
        }
    });
}

/// Barge-in rule: a meaningful interim utterance while audio is playing.
fn should_interrupt(utterance: &str, outstanding_marks: usize) -> bool {
    utterance.chars().count() > INTERRUPTION_MIN_CHARS && outstanding_marks > 0
}

/// Mark label for one synthesized chunk; unique across repeated indices.
fn mark_label(index: u32, request_id: Uuid) -> String {
    format!("seg-{index}-{request_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_requires_length_and_outstanding_audio() {
        // Long utterance while audio plays: barge-in.
        assert!(should_interrupt("Actually stop", 2));
        // Short noises are ignored.
        assert!(!should_interrupt("um", 2));
        assert!(!should_interrupt("yes", 1));
        // Nothing playing: nothing to interrupt.
        assert!(!should_interrupt("Actually stop", 0));
        // Boundary: exactly five characters does not trigger.
        assert!(!should_interrupt("hello", 3));
        assert!(should_interrupt("hello!", 3));
    }

    #[test]
    fn mark_labels_are_unique_per_request() {
        let a = mark_label(0, Uuid::new_v4());
        let b = mark_label(0, Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("seg-0-"));
    }

    #[test]
    fn greetings_are_nonempty_and_speakable() {
        for greeting in GREETINGS {
            assert!(!greeting.is_empty());
            assert!(greeting.chars().count() < 80);
        }
    }
}
