//! Signed webhook delivery with bounded retry behind a per-plugin breaker.
//!
//! [`WebhookService`] POSTs a [`WebhookEnvelope`] to each endpoint a plugin
//! configures. Every request carries an HMAC-SHA256 signature over
//! `"{timestamp}.{body}"`. Delivery is advisory: failures are retried, logged
//! and reported in the returned [`WebhookDelivery`], never raised.

use std::sync::Arc;
use std::time::{Duration, Instant};

use formflow_core::plugin::{webhook_breaker_key, WebhookConfig};
use formflow_core::resilience::{
    call_with_retry, BreakerRejected, CircuitBreakerRegistry, ResilienceError, RetryPolicy,
};
use formflow_core::signing::sign;
use formflow_core::types::DbId;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::event::{WebhookEnvelope, WebhookEvent};

pub const SIGNATURE_HEADER: &str = "X-FormFlow-Signature";
pub const TIMESTAMP_HEADER: &str = "X-FormFlow-Timestamp";
pub const EVENT_HEADER: &str = "X-FormFlow-Event";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    /// Timeout for a single HTTP attempt.
    pub timeout: Duration,
    /// Attempts for endpoints that do not set `max_retries`.
    pub default_max_retries: u32,
    /// Backoff before the second attempt; doubles afterwards.
    pub initial_backoff: Duration,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            default_max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The HTTP request itself failed (DNS, connect, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Circuit breaker {key} is open, retry in {}s", retry_after.as_secs())]
    CircuitOpen { key: String, retry_after: Duration },

    #[error("Failed to serialize webhook payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BreakerRejected> for WebhookError {
    fn from(rejected: BreakerRejected) -> Self {
        Self::CircuitOpen {
            key: rejected.key,
            retry_after: rejected.retry_after,
        }
    }
}

impl ResilienceError for WebhookError {
    fn trips_breaker(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::HttpStatus(status) => *status >= 500,
            Self::CircuitOpen { .. } | Self::Serialization(_) => false,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::HttpStatus(status) => *status >= 500 || *status == 429,
            Self::CircuitOpen { .. } | Self::Serialization(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Outcome of delivering one event to one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub event: WebhookEvent,
    pub url: String,
    /// The exact body that was (or would have been) sent.
    pub payload: String,
    pub signature: String,
    pub timestamp: String,
    /// Last HTTP status received, if any request got an answer.
    pub status_code: Option<u16>,
    /// HTTP attempts made. Zero when the breaker rejected the delivery.
    pub attempts: u32,
    pub succeeded: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// WebhookService
// ---------------------------------------------------------------------------

/// Delivers plugin events to their configured webhook endpoints.
///
/// All endpoints of one plugin share the breaker `webhook_{plugin_id}`, so a
/// receiver that is down stops costing request timeouts after a few tries.
pub struct WebhookService {
    client: reqwest::Client,
    breakers: Arc<CircuitBreakerRegistry>,
    settings: WebhookSettings,
}

impl WebhookService {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        settings: WebhookSettings,
    ) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("formflow-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            breakers,
            settings,
        })
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    /// Deliver `event` to one endpoint, retrying per its `max_retries`.
    ///
    /// Never fails; the outcome is in the returned [`WebhookDelivery`].
    pub async fn send(
        &self,
        plugin_id: DbId,
        config: &WebhookConfig,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> WebhookDelivery {
        let started = Instant::now();
        let envelope = WebhookEnvelope::new(event, data);
        let mut delivery = WebhookDelivery {
            event,
            url: config.url.clone(),
            payload: String::new(),
            signature: String::new(),
            timestamp: envelope.timestamp.clone(),
            status_code: None,
            attempts: 0,
            succeeded: false,
            duration: Duration::ZERO,
            error: None,
        };

        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                let e = WebhookError::from(e);
                tracing::error!(plugin_id, event = %event, error = %e, "Webhook payload not serializable");
                delivery.error = Some(e.to_string());
                delivery.duration = started.elapsed();
                return delivery;
            }
        };
        let signature = sign(&payload, &config.secret, &envelope.timestamp);

        let breaker = self.breakers.get(&webhook_breaker_key(plugin_id)).await;
        let policy = RetryPolicy::exponential(
            config
                .max_retries
                .unwrap_or(self.settings.default_max_retries),
            self.settings.initial_backoff,
        );

        let mut attempts = 0;
        let result = call_with_retry(&breaker, &policy, |attempt| {
            attempts = attempt;
            self.post(config, event, &envelope.timestamp, &payload, &signature)
        })
        .await;

        delivery.payload = payload;
        delivery.signature = signature;
        delivery.attempts = attempts;
        delivery.duration = started.elapsed();

        match result {
            Ok(status) => {
                delivery.status_code = Some(status);
                delivery.succeeded = true;
                tracing::info!(
                    plugin_id,
                    event = %event,
                    url = %config.url,
                    status,
                    attempts,
                    "Webhook delivered"
                );
            }
            Err(e) => {
                if let WebhookError::HttpStatus(status) = e {
                    delivery.status_code = Some(status);
                }
                tracing::warn!(
                    plugin_id,
                    event = %event,
                    url = %config.url,
                    attempts,
                    error = %e,
                    "Webhook delivery failed"
                );
                delivery.error = Some(e.to_string());
            }
        }
        delivery
    }

    /// Deliver to one endpoint on a background task.
    ///
    /// The caller may drop the handle; the outcome is logged either way.
    pub fn send_fire_and_forget(
        self: &Arc<Self>,
        plugin_id: DbId,
        config: WebhookConfig,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> JoinHandle<WebhookDelivery> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.send(plugin_id, &config, event, data).await })
    }

    /// Deliver to every enabled endpoint concurrently. Disabled endpoints
    /// are skipped and get no entry in the result.
    pub async fn send_batch(
        &self,
        plugin_id: DbId,
        configs: &[WebhookConfig],
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> Vec<WebhookDelivery> {
        let sends = configs
            .iter()
            .filter(|config| config.is_enabled)
            .map(|config| self.send(plugin_id, config, event, data.clone()));
        futures::future::join_all(sends).await
    }

    /// [`send_batch`](Self::send_batch) on a background task. Returns `None`
    /// without spawning when no endpoint is enabled.
    pub fn send_batch_fire_and_forget(
        self: &Arc<Self>,
        plugin_id: DbId,
        configs: &[WebhookConfig],
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> Option<JoinHandle<Vec<WebhookDelivery>>> {
        let enabled: Vec<WebhookConfig> = configs
            .iter()
            .filter(|config| config.is_enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return None;
        }
        let service = Arc::clone(self);
        Some(tokio::spawn(async move {
            service.send_batch(plugin_id, &enabled, event, data).await
        }))
    }

    /// Send a `webhook.test` event so a user can check an endpoint and their
    /// signature verification before relying on it.
    pub async fn send_test(&self, plugin_id: DbId, config: &WebhookConfig) -> WebhookDelivery {
        self.send(
            plugin_id,
            config,
            WebhookEvent::Test,
            serde_json::json!({
                "plugin_id": plugin_id,
                "message": "Test delivery from FormFlow",
            }),
        )
        .await
    }

    /// A single POST. Returns the status code on 2xx.
    async fn post(
        &self,
        config: &WebhookConfig,
        event: WebhookEvent,
        timestamp: &str,
        payload: &str,
        signature: &str,
    ) -> Result<u16, WebhookError> {
        let response = self
            .client
            .post(&config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp)
            .header(EVENT_HEADER, event.as_str())
            .body(payload.to_owned())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::HttpStatus(status.as_u16()));
        }
        Ok(status.as_u16())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_trip_and_retry() {
        let err = WebhookError::HttpStatus(502);
        assert!(err.trips_breaker());
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_neither_trip_nor_retry() {
        let err = WebhookError::HttpStatus(400);
        assert!(!err.trips_breaker());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_is_retried_without_tripping() {
        let err = WebhookError::HttpStatus(429);
        assert!(!err.trips_breaker());
        assert!(err.is_retryable());
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
    }

    #[test]
    fn breaker_rejection_maps_to_circuit_open() {
        let err = WebhookError::from(BreakerRejected {
            key: "webhook_3".into(),
            retry_after: Duration::from_secs(12),
        });
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Circuit breaker webhook_3 is open, retry in 12s"
        );
    }

    #[test]
    fn new_does_not_fail_with_defaults() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(Default::default()));
        assert!(WebhookService::new(breakers, WebhookSettings::default()).is_ok());
    }
}
