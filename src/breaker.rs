//! Circuit breaker guarding the TTS vendor.
//!
//! Three states: CLOSED passes requests and counts consecutive failures,
//! OPEN short-circuits everything until the recovery window elapses, and
//! HALF_OPEN admits exactly one probe. Transitions are published on an
//! optional event channel so the pipeline can observe trips and drain the
//! synthesis queue.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Public view of the breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests pass normally.
    Closed,
    /// Requests short-circuit.
    Open,
    /// One probe request is admitted.
    HalfOpen,
}

/// What the breaker decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Pass the request through.
    Allow,
    /// Pass exactly this request as the recovery probe.
    Probe,
    /// Fail fast without touching the network.
    ShortCircuit,
}

/// Observable state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    /// CLOSED → OPEN after hitting the failure threshold.
    Tripped {
        /// Consecutive failures at trip time.
        failures: u32,
    },
    /// OPEN → HALF_OPEN after the recovery window.
    Probing,
    /// HALF_OPEN → CLOSED on probe success.
    Recovered,
    /// HALF_OPEN → OPEN on probe failure.
    ReOpened,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery: Duration,
    state: State,
    events: Option<mpsc::UnboundedSender<BreakerEvent>>,
}

impl CircuitBreaker {
    /// New breaker in the CLOSED state.
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery,
            state: State::Closed { failures: 0 },
            events: None,
        }
    }

    /// Attach a transition event channel.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BreakerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Current state, advancing OPEN → HALF_OPEN when the window elapsed.
    pub fn state(&mut self) -> BreakerState {
        self.advance(Instant::now());
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures counted in the CLOSED state.
    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            State::Closed { failures } => failures,
            _ => 0,
        }
    }

    /// Decide admission for the next request.
    ///
    /// In HALF_OPEN the first caller gets [`Admission::Probe`]; the state
    /// stays HALF_OPEN until [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) resolves the probe, and any
    /// further request short-circuits meanwhile.
    pub fn try_acquire(&mut self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> Admission {
        self.advance(now);
        match &mut self.state {
            State::Closed { .. } => Admission::Allow,
            State::Open { .. } => Admission::ShortCircuit,
            State::HalfOpen => Admission::Probe,
        }
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        match self.state {
            State::Closed { .. } => self.state = State::Closed { failures: 0 },
            State::HalfOpen => {
                info!("circuit breaker recovered");
                self.state = State::Closed { failures: 0 };
                self.emit(BreakerEvent::Recovered);
            }
            // Success arriving while OPEN belongs to a request admitted
            // before the trip; the short-circuit window is unaffected.
            State::Open { .. } => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&mut self, now: Instant) {
        match self.state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    warn!(failures, "circuit breaker tripped");
                    self.state = State::Open { since: now };
                    self.emit(BreakerEvent::Tripped { failures });
                } else {
                    self.state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                warn!("circuit breaker probe failed, re-opening");
                self.state = State::Open { since: now };
                self.emit(BreakerEvent::ReOpened);
            }
            State::Open { .. } => {}
        }
    }

    /// Whether a request admitted now would short-circuit.
    pub fn is_open(&mut self) -> bool {
        self.state() == BreakerState::Open
    }

    fn advance(&mut self, now: Instant) {
        if let State::Open { since } = self.state
            && now.duration_since(since) >= self.recovery
        {
            info!("circuit breaker recovery window elapsed, probing");
            self.state = State::HalfOpen;
            self.emit(BreakerEvent::Probing);
        }
    }

    fn emit(&self, event: BreakerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
