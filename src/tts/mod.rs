//! Ordered, rate-limited text-to-speech synthesis.
//!
//! A single worker consumes a FIFO of segments; both `generate` and
//! `clear` travel through the same command channel, so their ordering is
//! total and the worker never races a clear against a new submission.
//! Segment indices are assigned by the LLM adapter at submission; the
//! single-threaded worker preserves that order in its `Speech` emissions.
//!
//! Rate limiting is adaptive: the inter-request delay grows sub-linearly
//! with the trailing error count (more steeply on 429s) and decays
//! multiplicatively on success, bounded between the configured baseline
//! and ten seconds. A circuit breaker guards the vendor; a trip drains
//! the queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{Admission, BreakerEvent, CircuitBreaker};
use crate::config::TtsConfig;
use crate::error::AgentError;
use crate::retry::{Classified, RetryPolicy, sleep_cancellable};

/// Hard ceiling on the adaptive inter-request delay.
const MAX_ADAPTIVE_DELAY: Duration = Duration::from_secs(10);

/// Trailing window over which errors influence the delay.
const ERROR_WINDOW: Duration = Duration::from_secs(30);

/// One queued unit of synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsSegment {
    /// Ordering key assigned at submission.
    pub index: u32,
    /// Text to synthesize.
    pub text: String,
    /// Interaction counter tag.
    pub interaction_count: u32,
}

/// Why the queue was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// Caller barge-in.
    Interruption,
    /// Circuit breaker is open.
    BreakerOpen,
    /// The call ended.
    SessionEnd,
}

/// Events emitted to the playback side.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// Synthesized audio for one segment.
    Speech {
        /// Synthesis request id (basis for the playback mark label).
        request_id: Uuid,
        /// Segment ordering key.
        index: u32,
        /// Raw μ-law audio from the vendor.
        audio: Bytes,
        /// The text that was synthesized.
        text: String,
        /// Interaction counter tag.
        interaction_count: u32,
    },
    /// The queue was drained; pending segments will never be spoken.
    QueueCleared {
        /// Why the drain happened.
        reason: ClearReason,
        /// How many queued segments were dropped.
        dropped: usize,
    },
}

enum TtsCommand {
    Generate(TtsSegment),
    Clear(ClearReason),
}

/// Handle to the synthesis worker. Cheap to clone.
#[derive(Clone)]
pub struct TtsAdapter {
    cmd_tx: mpsc::UnboundedSender<TtsCommand>,
    active: Arc<Mutex<HashSet<Uuid>>>,
    clear_token: Arc<Mutex<CancellationToken>>,
}

impl std::fmt::Debug for TtsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsAdapter").finish_non_exhaustive()
    }
}

impl TtsAdapter {
    /// Spawn the worker and return its handle.
    ///
    /// `baseline` is the configured inter-request spacing floor; breaker
    /// transitions are published on `breaker_events` when provided.
    pub fn spawn(
        config: TtsConfig,
        baseline: Duration,
        events: mpsc::Sender<TtsEvent>,
        breaker_events: Option<mpsc::UnboundedSender<BreakerEvent>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(HashSet::new()));
        let clear_token = Arc::new(Mutex::new(CancellationToken::new()));

        let worker = Worker {
            client: TtsClient::new(&config),
            breaker: match breaker_events {
                Some(tx) => CircuitBreaker::new(
                    config.breaker_threshold,
                    Duration::from_millis(config.breaker_recovery_ms),
                )
                .with_events(tx),
                None => CircuitBreaker::new(
                    config.breaker_threshold,
                    Duration::from_millis(config.breaker_recovery_ms),
                ),
            },
            pacer: AdaptivePacer::new(baseline),
            queue: VecDeque::new(),
            active: Arc::clone(&active),
            clear_token: Arc::clone(&clear_token),
            events,
        };
        tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            active,
            clear_token,
        }
    }

    /// Queue one segment for synthesis.
    pub fn generate(&self, segment: TtsSegment) {
        let _ = self.cmd_tx.send(TtsCommand::Generate(segment));
    }

    /// Drop all pending work and suppress in-flight emissions.
    ///
    /// Takes effect immediately for the active request set and any pacing
    /// or retry sleep; the queue itself drains when the worker processes
    /// the command, which is ordered after any earlier `generate`.
    pub fn clear(&self, reason: ClearReason) {
        if let Ok(mut active) = self.active.lock() {
            active.clear();
        }
        if let Ok(token) = self.clear_token.lock() {
            token.cancel();
        }
        let _ = self.cmd_tx.send(TtsCommand::Clear(reason));
    }
}

struct Worker {
    client: TtsClient,
    breaker: CircuitBreaker,
    pacer: AdaptivePacer,
    queue: VecDeque<TtsSegment>,
    active: Arc<Mutex<HashSet<Uuid>>>,
    clear_token: Arc<Mutex<CancellationToken>>,
    events: mpsc::Sender<TtsEvent>,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TtsCommand>) {
        loop {
            // Absorb every command already waiting so a clear issued after
            // a burst of generates lands in order.
            loop {
                match cmd_rx.try_recv() {
                    Ok(cmd) => self.apply(cmd).await,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        debug!("TTS command channel closed, worker exiting");
                        return;
                    }
                }
            }

            if self.queue.is_empty() {
                match cmd_rx.recv().await {
                    Some(cmd) => {
                        self.apply(cmd).await;
                        continue;
                    }
                    None => {
                        debug!("TTS command channel closed, worker exiting");
                        return;
                    }
                }
            }

            match self.breaker.try_acquire() {
                Admission::ShortCircuit => {
                    self.drain(ClearReason::BreakerOpen).await;
                    continue;
                }
                Admission::Allow => {}
                Admission::Probe => info!("TTS breaker probing with next segment"),
            }

            let Some(segment) = self.queue.pop_front() else {
                continue;
            };
            self.process(segment).await;
        }
    }

    async fn apply(&mut self, cmd: TtsCommand) {
        match cmd {
            TtsCommand::Generate(segment) => self.queue.push_back(segment),
            TtsCommand::Clear(reason) => {
                if let Ok(mut active) = self.active.lock() {
                    active.clear();
                }
                // Arm a fresh token so subsequent generates run normally.
                if let Ok(mut token) = self.clear_token.lock() {
                    *token = CancellationToken::new();
                }
                self.drain(reason).await;
            }
        }
    }

    async fn drain(&mut self, reason: ClearReason) {
        let dropped = self.queue.len();
        self.queue.clear();
        debug!(?reason, dropped, "TTS queue cleared");
        let _ = self
            .events
            .send(TtsEvent::QueueCleared { reason, dropped })
            .await;
    }

    async fn process(&mut self, segment: TtsSegment) {
        let token = match self.clear_token.lock() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };

        // Cancellable pacing sleep; a clear lands here within one cycle.
        let delay = self.pacer.required_delay(Instant::now());
        if !delay.is_zero() {
            debug!(?delay, index = segment.index, "TTS pacing delay");
        }
        if !sleep_cancellable(delay, &token).await {
            return;
        }

        let request_id = Uuid::new_v4();
        if let Ok(mut active) = self.active.lock() {
            active.insert(request_id);
        }
        self.pacer.note_request(Instant::now());

        let attempt_failures = Arc::new(Mutex::new(Vec::<bool>::new()));
        let policy = RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(4));
        let client = &self.client;
        let failures = Arc::clone(&attempt_failures);
        let text = segment.text.clone();
        let op_token = token.clone();

        let result = policy
            .run(&token, move |attempt| {
                let client = client.clone();
                let text = text.clone();
                let failures = Arc::clone(&failures);
                let token = op_token.clone();
                async move {
                    let outcome = tokio::select! {
                        () = token.cancelled() => {
                            Err(Classified::cancelled(AgentError::Cancelled))
                        }
                        result = client.synthesize(&text) => result,
                    };
                    if let Err(classified) = &outcome
                        && !matches!(
                            classified.class,
                            crate::retry::Classification::Cancelled
                        )
                    {
                        debug!(attempt, "TTS attempt failed");
                        if let Ok(mut failures) = failures.lock() {
                            failures.push(classified.is_rate_limited());
                        }
                    }
                    outcome
                }
            })
            .await;

        // Every vendor-visible failure counts toward the breaker and the
        // pacer, whether or not a later attempt succeeded.
        let failed_attempts = attempt_failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();
        for rate_limited in &failed_attempts {
            self.breaker.record_failure();
            self.pacer.record_failure(*rate_limited, Instant::now());
        }

        match result {
            Ok(audio) => {
                self.breaker.record_success();
                self.pacer.record_success();
                let still_active = self
                    .active
                    .lock()
                    .map(|mut active| active.remove(&request_id))
                    .unwrap_or(false);
                if !still_active {
                    debug!(index = segment.index, "suppressing cancelled TTS emission");
                    return;
                }
                let _ = self
                    .events
                    .send(TtsEvent::Speech {
                        request_id,
                        index: segment.index,
                        audio,
                        text: segment.text,
                        interaction_count: segment.interaction_count,
                    })
                    .await;
            }
            Err(error) => {
                if let Ok(mut active) = self.active.lock() {
                    active.remove(&request_id);
                }
                match error.into_inner() {
                    Some(e) => warn!(index = segment.index, error = %e, "TTS synthesis failed"),
                    None => {
                        debug!(index = segment.index, "TTS synthesis cancelled");
                        return;
                    }
                }
                if self.breaker.is_open() {
                    self.drain(ClearReason::BreakerOpen).await;
                }
            }
        }
    }
}

// ── Adaptive pacing ───────────────────────────────────────────

/// Trailing-window pacer for the synthesis RPC.
#[derive(Debug)]
struct AdaptivePacer {
    baseline: Duration,
    current: Duration,
    last_request: Option<Instant>,
    errors: VecDeque<(Instant, bool)>,
}

impl AdaptivePacer {
    fn new(baseline: Duration) -> Self {
        Self {
            baseline,
            current: baseline,
            last_request: None,
            errors: VecDeque::new(),
        }
    }

    /// Remaining delay before the next request may be dispatched.
    fn required_delay(&self, now: Instant) -> Duration {
        match self.last_request {
            Some(last) => self.current.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        }
    }

    fn note_request(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    /// Decay multiplicatively toward the baseline.
    fn record_success(&mut self) {
        let decayed = self.current.mul_f64(0.75);
        self.current = decayed.max(self.baseline);
    }

    /// Grow sub-linearly in the trailing error count; rate limits push
    /// harder than plain failures.
    fn record_failure(&mut self, rate_limited: bool, now: Instant) {
        self.errors.push_back((now, rate_limited));
        while let Some(&(at, _)) = self.errors.front() {
            if now.duration_since(at) > ERROR_WINDOW {
                self.errors.pop_front();
            } else {
                break;
            }
        }

        let count = self.errors.len() as f64;
        let weight = if self.errors.iter().any(|&(_, rl)| rl) {
            1.5
        } else {
            0.5
        };
        let grown = self.baseline.mul_f64(1.0 + count.sqrt() * weight);
        self.current = grown.clamp(self.baseline, MAX_ADAPTIVE_DELAY);
    }
}

// ── Vendor client ─────────────────────────────────────────────

/// HTTP client for the synthesis RPC.
#[derive(Clone)]
struct TtsClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    voice_model: String,
    request_timeout: Duration,
}

impl TtsClient {
    fn new(config: &TtsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            voice_model: config.voice_model.clone(),
            request_timeout: config.request_timeout,
        }
    }

    fn speak_url(&self) -> String {
        format!(
            "{}/v1/speak?model={}&encoding=mulaw&sample_rate=8000&container=none",
            self.endpoint, self.voice_model
        )
    }

    /// One synthesis attempt; the payload is raw μ-law audio.
    async fn synthesize(&self, text: &str) -> Result<Bytes, Classified<AgentError>> {
        let response = self
            .http
            .post(self.speak_url())
            .header("Authorization", format!("Token {}", self.api_key))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({"text": text}))
            .send()
            .await
            .map_err(|e| {
                Classified::retryable(AgentError::Tts(format!("request failed: {e}")))
            })?;

        let status = response.status();
        if status.is_success() {
            return response.bytes().await.map_err(|e| {
                Classified::retryable(AgentError::Tts(format!("body read failed: {e}")))
            });
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let error = AgentError::Tts(format!("vendor returned HTTP {}", status.as_u16()));
        Err(match status.as_u16() {
            429 => Classified::rate_limited(error, retry_after),
            500..=599 => Classified::retryable(error),
            _ => Classified::fatal(error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── AdaptivePacer ─────────────────────────────────────────

    #[test]
    fn pacer_starts_at_baseline_with_no_delay() {
        let pacer = AdaptivePacer::new(Duration::from_millis(200));
        assert_eq!(pacer.required_delay(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn pacer_spaces_requests_by_current_delay() {
        let mut pacer = AdaptivePacer::new(Duration::from_millis(200));
        let now = Instant::now();
        pacer.note_request(now);
        let delay = pacer.required_delay(now + Duration::from_millis(50));
        assert_eq!(delay, Duration::from_millis(150));
        assert_eq!(
            pacer.required_delay(now + Duration::from_millis(500)),
            Duration::ZERO
        );
    }

    #[test]
    fn pacer_grows_sublinearly_and_caps() {
        let mut pacer = AdaptivePacer::new(Duration::from_millis(200));
        let now = Instant::now();
        pacer.record_failure(false, now);
        let after_one = pacer.current;
        pacer.record_failure(false, now);
        pacer.record_failure(false, now);
        pacer.record_failure(false, now);
        let after_four = pacer.current;

        assert!(after_one > Duration::from_millis(200));
        assert!(after_four > after_one);
        // sqrt growth: four errors is 2x one error's bump, not 4x.
        assert!(after_four < after_one * 3);

        for _ in 0..500 {
            pacer.record_failure(true, now);
        }
        assert_eq!(pacer.current, MAX_ADAPTIVE_DELAY);
    }

    #[test]
    fn pacer_rate_limits_grow_faster_than_plain_failures() {
        let now = Instant::now();
        let mut plain = AdaptivePacer::new(Duration::from_millis(200));
        plain.record_failure(false, now);
        let mut limited = AdaptivePacer::new(Duration::from_millis(200));
        limited.record_failure(true, now);
        assert!(limited.current > plain.current);
    }

    #[test]
    fn pacer_decays_toward_baseline_on_success() {
        let mut pacer = AdaptivePacer::new(Duration::from_millis(200));
        pacer.record_failure(true, Instant::now());
        let grown = pacer.current;

        pacer.record_success();
        assert!(pacer.current < grown);
        for _ in 0..50 {
            pacer.record_success();
        }
        assert_eq!(pacer.current, Duration::from_millis(200));
    }

    #[test]
    fn pacer_window_forgets_old_errors() {
        let mut pacer = AdaptivePacer::new(Duration::from_millis(200));
        let past = Instant::now() - Duration::from_secs(120);
        pacer.record_failure(false, past);
        // A new failure far outside the window only sees itself.
        pacer.record_failure(false, Instant::now());
        assert_eq!(pacer.errors.len(), 1);
    }

    // ── TtsClient request shape ───────────────────────────────

    #[test]
    fn speak_url_carries_codec_and_voice() {
        let config = TtsConfig {
            voice_model: "aura-asteria-en".to_owned(),
            endpoint: "https://api.example.com/".to_owned(),
            ..TtsConfig::default()
        };
        let client = TtsClient::new(&config);
        let url = client.speak_url();
        assert!(url.starts_with("https://api.example.com/v1/speak?"));
        assert!(url.contains("model=aura-asteria-en"));
        assert!(url.contains("encoding=mulaw"));
        assert!(url.contains("sample_rate=8000"));
        assert!(url.contains("container=none"));
    }

    // ── Clear semantics on the handle ─────────────────────────

    #[tokio::test]
    async fn clear_empties_active_set_and_cancels_token() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let adapter = TtsAdapter::spawn(
            TtsConfig::default(),
            Duration::from_millis(10),
            events_tx,
            None,
        );

        let id = Uuid::new_v4();
        adapter
            .active
            .lock()
            .expect("active lock")
            .insert(id);
        let token = adapter.clear_token.lock().expect("token lock").clone();

        adapter.clear(ClearReason::Interruption);

        assert!(adapter.active.lock().expect("active lock").is_empty());
        assert!(token.is_cancelled());
    }
}
