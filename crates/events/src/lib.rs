//! FormFlow outbound notifications.
//!
//! - [`WebhookEvent`] / [`WebhookEnvelope`]: the event names and JSON body
//!   every webhook receives.
//! - [`delivery`]: signed, retried, breaker-protected HTTP delivery
//!   ([`WebhookService`]).
//!
//! Signing lives in `formflow_core::signing` so receivers can verify without
//! pulling in an HTTP client; it is re-exported here for convenience.

pub mod delivery;
pub mod event;

pub use delivery::webhook::{
    WebhookDelivery, WebhookError, WebhookService, WebhookSettings, EVENT_HEADER,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use event::{WebhookEnvelope, WebhookEvent};
pub use formflow_core::signing::{sign, verify_signature};
