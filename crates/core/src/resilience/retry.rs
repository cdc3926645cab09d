//! Bounded retries behind a circuit breaker.

use std::future::Future;
use std::time::Duration;

use super::breaker::{Admission, BreakerRejected, CircuitBreaker};

/// Errors that can flow through [`call_with_retry`].
pub trait ResilienceError: From<BreakerRejected> {
    /// Whether this failure says the dependency itself is unhealthy.
    ///
    /// Errors caused by the request (constraint violations, bad SQL, a 4xx
    /// response) must return `false` so they do not open the breaker.
    fn trips_breaker(&self) -> bool;

    /// Whether the call failed before it reached the dependency, e.g. while
    /// reading its own settings. Such failures neither trip nor reset the
    /// breaker.
    fn bypasses_breaker(&self) -> bool {
        false
    }

    /// Whether another attempt might succeed.
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff between attempts of a single logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Doubling backoff starting at `initial_backoff`, capped at 30 seconds.
    pub fn exponential(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500))
    }
}

/// Run `op` through `breaker`, retrying retryable failures per `policy`.
///
/// `op` receives the 1-based attempt number. An open breaker rejects before
/// `op` runs and is never retried. Failures that trip the breaker are
/// recorded on it; any other outcome counts as the dependency answering.
pub async fn call_with_retry<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    E: ResilienceError + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let admission = breaker.try_acquire().map_err(E::from)?;

        match op(attempt).await {
            Ok(value) => {
                breaker.record_success(admission);
                return Ok(value);
            }
            Err(err) => {
                record_error(breaker, admission, &err);

                if !err.is_retryable() || attempt >= max_attempts {
                    return Err(err);
                }

                let delay = policy.backoff_after(attempt);
                tracing::debug!(
                    breaker = %breaker.key(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run `op` once through `breaker`.
pub async fn call_guarded<T, E, Fut>(breaker: &CircuitBreaker, op: Fut) -> Result<T, E>
where
    E: ResilienceError,
    Fut: Future<Output = Result<T, E>>,
{
    let admission = breaker.try_acquire().map_err(E::from)?;
    let result = op.await;
    match &result {
        Ok(_) => breaker.record_success(admission),
        Err(err) => record_error(breaker, admission, err),
    }
    result
}

/// Account a failed call on `breaker`.
pub fn record_error<E: ResilienceError>(breaker: &CircuitBreaker, admission: Admission, err: &E) {
    if err.bypasses_breaker() {
        return;
    }
    if err.trips_breaker() {
        breaker.record_failure();
    } else {
        breaker.record_success(admission);
    }
}
