//! Retry combinator with error classification and cancellable backoff.
//!
//! Adapters wrap their vendor calls in [`RetryPolicy::run`]. The attempt
//! closure reports a [`Classified`] error so the combinator knows whether
//! to back off and retry, honor a `Retry-After` hint, or abort. All waits
//! go through [`sleep_cancellable`] so a cancellation arriving mid-backoff
//! is honored within one cycle.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How an attempt's failure should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Server 5xx, network timeout, transient close: retry with backoff.
    Retryable,
    /// 429 or vendor rate signal: retry, honoring any `Retry-After` hint.
    RateLimited {
        /// Vendor-provided wait hint, if any.
        retry_after: Option<Duration>,
    },
    /// 4xx other than 429, semantic errors: abort immediately.
    Fatal,
    /// Cooperative cancel observed inside the attempt.
    Cancelled,
}

/// An error paired with its retry classification.
#[derive(Debug)]
pub struct Classified<E> {
    /// The underlying error.
    pub error: E,
    /// How the combinator should treat it.
    pub class: Classification,
}

impl<E> Classified<E> {
    /// A transient failure worth retrying.
    pub fn retryable(error: E) -> Self {
        Self {
            error,
            class: Classification::Retryable,
        }
    }

    /// A rate-limit failure, optionally with a vendor wait hint.
    pub fn rate_limited(error: E, retry_after: Option<Duration>) -> Self {
        Self {
            error,
            class: Classification::RateLimited { retry_after },
        }
    }

    /// A failure that must not be retried.
    pub fn fatal(error: E) -> Self {
        Self {
            error,
            class: Classification::Fatal,
        }
    }

    /// A cooperative cancellation.
    pub fn cancelled(error: E) -> Self {
        Self {
            error,
            class: Classification::Cancelled,
        }
    }

    /// Whether this failure counted against the vendor rate limit.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.class, Classification::RateLimited { .. })
    }
}

/// Classify an HTTP status code the way the adapters do.
pub fn classify_status(status: u16) -> Classification {
    match status {
        429 => Classification::RateLimited { retry_after: None },
        500..=599 => Classification::Retryable,
        _ => Classification::Fatal,
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// All attempts failed with retryable errors; the last one is carried.
    Exhausted(E),
    /// An attempt failed with a non-retryable error.
    Fatal(E),
    /// Cancellation was observed before an attempt succeeded.
    Cancelled,
}

impl<E> RetryError<E> {
    /// Extract the underlying error, if one was carried.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted(e) | Self::Fatal(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Jittered exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and delays, keeping default jitter.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Backoff delay before attempt `attempt` (1-based; attempt 1 has none).
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`, plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if self.jitter_ratio <= 0.0 {
            return capped;
        }
        let jitter_cap = capped.as_secs_f64() * self.jitter_ratio;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_cap.max(f64::EPSILON));
        capped + Duration::from_secs_f64(jitter)
    }

    /// Run `op` up to `max_attempts` times with classified backoff.
    ///
    /// The closure receives the 1-based attempt number. Cancellation is
    /// checked before every attempt and during every backoff wait.
    ///
    /// # Errors
    ///
    /// [`RetryError::Fatal`] on a non-retryable failure,
    /// [`RetryError::Exhausted`] when attempts run out, and
    /// [`RetryError::Cancelled`] when the token fires first.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, Classified<E>>>,
    {
        let mut last_error: Option<E> = None;

        for attempt in 1..=self.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(classified) => match classified.class {
                    Classification::Fatal => return Err(RetryError::Fatal(classified.error)),
                    Classification::Cancelled => return Err(RetryError::Cancelled),
                    Classification::Retryable => {
                        warn!(attempt, "retryable failure");
                        last_error = Some(classified.error);
                        if attempt < self.max_attempts
                            && !sleep_cancellable(self.delay_for(attempt + 1), cancel).await
                        {
                            return Err(RetryError::Cancelled);
                        }
                    }
                    Classification::RateLimited { retry_after } => {
                        warn!(attempt, "rate-limited failure");
                        last_error = Some(classified.error);
                        if attempt < self.max_attempts {
                            let wait = retry_after.unwrap_or_else(|| self.delay_for(attempt + 1));
                            if !sleep_cancellable(wait.min(self.max_delay), cancel).await {
                                return Err(RetryError::Cancelled);
                            }
                        }
                    }
                },
            }
        }

        match last_error {
            Some(e) => Err(RetryError::Exhausted(e)),
            None => Err(RetryError::Cancelled),
        }
    }
}

/// Sleep that aborts when the token fires.
///
/// Returns `true` when the full duration elapsed, `false` on cancellation.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = no_jitter(6);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(40));
        assert_eq!(policy.delay_for(5), Duration::from_millis(80));
        // Capped.
        assert_eq!(policy.delay_for(6), Duration::from_millis(80));
    }

    #[test]
    fn classify_status_matches_taxonomy() {
        assert_eq!(
            classify_status(429),
            Classification::RateLimited { retry_after: None }
        );
        assert_eq!(classify_status(500), Classification::Retryable);
        assert_eq!(classify_status(503), Classification::Retryable);
        assert_eq!(classify_status(400), Classification::Fatal);
        assert_eq!(classify_status(404), Classification::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = no_jitter(4)
            .run(&cancel, |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Classified::retryable("boom"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert!(matches!(result, Ok(42)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_aborts_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result: std::result::Result<u32, _> = no_jitter(5)
            .run(&cancel, |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Classified::fatal("bad request"))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal("bad request"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_carries_last_error() {
        let cancel = CancellationToken::new();
        let result: std::result::Result<u32, _> = no_jitter(3)
            .run(&cancel, |attempt| async move {
                Err(Classified::retryable(format!("fail {attempt}")))
            })
            .await;

        match result {
            Err(RetryError::Exhausted(e)) => assert_eq!(e, "fail 3"),
            other => unreachable!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honors_retry_after_hint() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let result = no_jitter(2)
            .run(&cancel, |_attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Classified::rate_limited(
                            "slow down",
                            Some(Duration::from_millis(50)),
                        ))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_is_honored() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // Cancel while the combinator sleeps between attempts.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel_clone.cancel();
        });

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        };
        let result: std::result::Result<u32, _> = policy
            .run(&cancel, |_attempt| async move {
                Err(Classified::retryable("transient"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_cancellable_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_cancellable(Duration::from_secs(5), &cancel).await);

        let fresh = CancellationToken::new();
        assert!(sleep_cancellable(Duration::from_millis(1), &fresh).await);
    }
}
