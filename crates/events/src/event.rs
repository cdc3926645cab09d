//! Webhook event names and the envelope they travel in.

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WebhookEvent
// ---------------------------------------------------------------------------

/// Dot-separated event name sent in the envelope and `X-FormFlow-Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "population.success")]
    PopulationSuccess,
    #[serde(rename = "population.failed")]
    PopulationFailed,
    #[serde(rename = "population.partial")]
    PopulationPartial,
    #[serde(rename = "dead_letter.exhausted")]
    DeadLetterExhausted,
    #[serde(rename = "webhook.test")]
    Test,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PopulationSuccess => "population.success",
            Self::PopulationFailed => "population.failed",
            Self::PopulationPartial => "population.partial",
            Self::DeadLetterExhausted => "dead_letter.exhausted",
            Self::Test => "webhook.test",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "population.success" => Ok(Self::PopulationSuccess),
            "population.failed" => Ok(Self::PopulationFailed),
            "population.partial" => Ok(Self::PopulationPartial),
            "dead_letter.exhausted" => Ok(Self::DeadLetterExhausted),
            "webhook.test" => Ok(Self::Test),
            other => Err(format!("Unknown webhook event: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookEnvelope
// ---------------------------------------------------------------------------

/// The JSON body of every webhook request: `{event, timestamp, data}`.
///
/// `timestamp` is the same ISO 8601 string sent in `X-FormFlow-Timestamp`
/// and covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: WebhookEvent,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl WebhookEnvelope {
    /// Envelope stamped with the current UTC time.
    pub fn new(event: WebhookEvent, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        }
    }
}
