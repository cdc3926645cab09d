//! Sliding-window circuit breaker.
//!
//! A [`CircuitBreaker`] counts failures inside a rolling time window. Once
//! `failure_threshold` failures fall inside the window the breaker opens and
//! rejects every call for `cooldown`. The first call after the cooldown moves
//! it to half-open and is admitted as the single trial; its outcome either
//! closes the breaker or re-opens it for another cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tunable thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    /// Length of the sliding failure window.
    pub window: Duration,
    /// How long the breaker stays open before admitting a trial call.
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal operation.
    Allowed,
    /// The single half-open trial call.
    Trial,
}

/// Returned when the breaker short-circuits a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit '{key}' is open; retry after {}ms", retry_after.as_millis())]
pub struct BreakerRejected {
    pub key: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// A per-dependency circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            key: key.into(),
            settings,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, moving Open -> HalfOpen if the cooldown has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Failures currently counted inside the window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        inner.failures.len()
    }

    /// Ask permission to make a call.
    ///
    /// Never blocks: an open breaker (or a half-open breaker whose trial is
    /// still in flight) rejects immediately.
    pub fn try_acquire(&self) -> Result<Admission, BreakerRejected> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::Open => Err(self.rejected(&inner, now)),
            CircuitState::HalfOpen => {
                // A trial that never reported back is considered lost after
                // one cooldown, so the breaker cannot wedge half-open.
                let trial_pending = inner
                    .trial_started
                    .is_some_and(|started| now.duration_since(started) < self.settings.cooldown);
                if trial_pending {
                    Err(BreakerRejected {
                        key: self.key.clone(),
                        retry_after: self.settings.cooldown,
                    })
                } else {
                    inner.trial_started = Some(now);
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a call that reached the dependency and got an answer.
    ///
    /// Only the half-open trial can close the breaker. A call admitted
    /// before the breaker opened may still finish afterwards; its success
    /// is ignored so traffic resumes only after the cooldown and a trial.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, _) => inner.failures.clear(),
            (CircuitState::HalfOpen, Admission::Trial) => {
                tracing::info!(breaker = %self.key, "Circuit closed after successful trial call");
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_started = None;
            }
            (state, admission) => {
                tracing::debug!(
                    breaker = %self.key,
                    ?state,
                    ?admission,
                    "Ignoring late success on a tripped circuit"
                );
            }
        }
    }

    /// Record a call that failed because the dependency is unhealthy.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.key, "Trial call failed, circuit re-opened");
                self.open(&mut inner, now);
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() >= self.settings.failure_threshold as usize {
                    tracing::warn!(
                        breaker = %self.key,
                        failures = inner.failures.len(),
                        cooldown_secs = self.settings.cooldown.as_secs(),
                        "Failure threshold reached, circuit opened"
                    );
                    self.open(&mut inner, now);
                }
            }
            CircuitState::Open => {
                inner.opened_at = Some(now);
            }
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_started = None;
        inner.failures.clear();
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|opened| now.duration_since(opened))
                .unwrap_or(self.settings.cooldown);
            if elapsed >= self.settings.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.trial_started = None;
            }
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > self.settings.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn rejected(&self, inner: &BreakerState, now: Instant) -> BreakerRejected {
        let elapsed = inner
            .opened_at
            .map(|opened| now.duration_since(opened))
            .unwrap_or_default();
        BreakerRejected {
            key: self.key.clone(),
            retry_after: self.settings.cooldown.saturating_sub(elapsed),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Point-in-time view of one breaker, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub recent_failures: usize,
}

/// Keyed collection of independent breakers (`plugin_{id}`, `webhook_{id}`).
///
/// The registry lock is only held to look up or insert a breaker; each
/// breaker guards its own state, so one plugin's failures never contend
/// with another's.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Fetch the breaker for `key`, creating it on first use.
    pub async fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(key) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.settings.clone()))),
        )
    }

    /// Drop a breaker so the next [`get`](Self::get) starts closed.
    pub async fn remove(&self, key: &str) -> bool {
        self.breakers.write().await.remove(key).is_some()
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshot: Vec<BreakerSnapshot> = breakers
            .values()
            .map(|b| BreakerSnapshot {
                key: b.key().to_string(),
                state: b.state(),
                recent_failures: b.failure_count(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        for _ in 0..2 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_matches!(breaker.try_acquire(), Err(BreakerRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success(Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Ok(Admission::Trial));
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.try_acquire(), Ok(Admission::Trial));
        breaker.record_success(Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Ok(Admission::Allowed));
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_does_not_close_open_circuit() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        let slow_call = breaker.try_acquire().unwrap();
        for _ in 0..3 {
            breaker.record_failure();
        }

        breaker.record_success(slow_call);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_trial_closes_half_open_circuit() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        let slow_call = breaker.try_acquire().unwrap();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial, Admission::Trial);

        breaker.record_success(slow_call);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens_for_full_cooldown() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.try_acquire(), Ok(Admission::Trial));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_trial_is_replaced_after_cooldown() {
        let breaker = CircuitBreaker::new("plugin_1", settings());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.try_acquire(), Ok(Admission::Trial));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.try_acquire(), Ok(Admission::Trial));
    }

    #[tokio::test]
    async fn registry_returns_same_breaker_per_key() {
        let registry = CircuitBreakerRegistry::new(settings());
        let a = registry.get("plugin_1").await;
        let b = registry.get("plugin_1").await;
        let c = registry.get("plugin_2").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn registry_breakers_are_independent() {
        let registry = CircuitBreakerRegistry::new(settings());
        let bad = registry.get("plugin_1").await;
        for _ in 0..3 {
            bad.record_failure();
        }
        let good = registry.get("plugin_2").await;
        assert_eq!(good.try_acquire(), Ok(Admission::Allowed));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "plugin_1");
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[1].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_remove_resets_breaker() {
        let registry = CircuitBreakerRegistry::new(settings());
        let breaker = registry.get("webhook_3").await;
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(registry.remove("webhook_3").await);
        assert_eq!(registry.get("webhook_3").await.state(), CircuitState::Closed);
    }
}
