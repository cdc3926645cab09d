//! Circuit breaking and bounded retry for calls to external systems.

pub mod breaker;
pub mod retry;

pub use breaker::{
    Admission, BreakerRejected, BreakerSettings, BreakerSnapshot, CircuitBreaker,
    CircuitBreakerRegistry, CircuitState,
};
pub use retry::{call_guarded, call_with_retry, record_error, ResilienceError, RetryPolicy};
