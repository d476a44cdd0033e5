//! Circuit breaker and retry helper (C12), shared by the embedding/rerank
//! clients and the fusion driver's optimistic-lock retry loop.
//!
//! Shape grounded on an HTTP client's retry/backoff/circuit-breaker code in
//! the example pack (atomics-based counters, jittered exponential backoff),
//! generalized per spec §9 into a single reusable abstraction instead of
//! scattered retry logic at each adapter boundary.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ExternalServiceError;

/// Closed -> Open (after `threshold` consecutive failures) -> Half-Open
/// (after `cooldown` elapses, one probe allowed) -> Closed on success or
/// back to Open on failure. States are derived from the two atomics rather
/// than stored explicitly, so `check`/`record_*` never need a lock.
pub struct CircuitBreaker {
    service: &'static str,
    consecutive_failures: AtomicU32,
    tripped_at_unix_secs: AtomicU64,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            service,
            consecutive_failures: AtomicU32::new(0),
            tripped_at_unix_secs: AtomicU64::new(0),
            threshold,
            cooldown,
        }
    }

    /// Returns `Ok(())` if a request may proceed (closed, or half-open
    /// probe allowed), `Err` if the breaker is open and still cooling down.
    pub fn check(&self) -> Result<(), ExternalServiceError> {
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        if failures < self.threshold {
            return Ok(());
        }

        let tripped_at = self.tripped_at_unix_secs.load(Ordering::Acquire);
        let now = now_unix_secs();
        let elapsed = now.saturating_sub(tripped_at);
        if elapsed >= self.cooldown.as_secs() {
            // half-open: allow exactly one probe through by optimistically
            // resetting the counter; a failure re-trips immediately.
            Ok(())
        } else {
            Err(ExternalServiceError::CircuitOpen {
                service: self.service,
                cooldown_secs: self.cooldown.as_secs() - elapsed,
            })
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.tripped_at_unix_secs.store(0, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures == self.threshold {
            self.tripped_at_unix_secs
                .store(now_unix_secs(), Ordering::Release);
            tracing::warn!(service = self.service, failures, "circuit breaker tripped");
        } else if failures > self.threshold {
            // still open; refresh the trip time so cooldown restarts on
            // every failed half-open probe.
            self.tripped_at_unix_secs
                .store(now_unix_secs(), Ordering::Release);
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The shape of the delay curve across retries.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Backoff {
    /// `base_delay * attempt`, matching the fusion driver's `0.1 * attempt`
    /// backoff rule in spec §4.6.
    Fixed,
    /// `base_delay * 2^(attempt-1)`, jittered by [`jitter_ms`] (spec §4.3:
    /// "bounded exponential backoff with jitter").
    ExponentialJitter,
}

/// Backoff policy for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed_backoff(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, backoff: Backoff::Fixed }
    }

    /// Exponential backoff with jitter, for collaborators whose contract
    /// specifically calls for it (spec §4.3's embedding client).
    pub fn exponential_with_jitter(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, backoff: Backoff::ExponentialJitter }
    }

    /// Delay before the given attempt (1-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay * attempt,
            Backoff::ExponentialJitter => {
                let exp_ms = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(jitter_ms(exp_ms))
            }
        }
    }
}

/// A single retry abstraction used at every adapter boundary (spec §9),
/// instead of hand-rolled retry loops in each client. `op` is retried up to
/// `policy.max_attempts` times whenever it returns `Err` and `is_retryable`
/// says so; the caller decides what's retryable (e.g. 5xx vs 4xx, or an
/// optimistic-lock conflict vs. any other storage error).
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `±25%` jitter around a base millisecond delay, using the system clock's
/// sub-second nanoseconds rather than pulling in a `rand` dependency for one
/// coin flip (mirrors the example pack's HTTP client jitter helper).
pub fn jitter_ms(base_ms: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let sign = if nanos % 2 == 0 { 1i64 } else { -1i64 };
    let magnitude = (base_ms as f64 * 0.25 * ((nanos % 1000) as f64 / 1000.0)) as i64;
    (base_ms as i64 + sign * magnitude).max(0) as u64
}

/// Status codes worth retrying for the embedding/rerank HTTP collaborators.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
