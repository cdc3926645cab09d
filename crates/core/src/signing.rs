//! Webhook HMAC-SHA256 signing.
//!
//! The signed message is `"{timestamp}.{payload}"` so a captured body cannot be
//! replayed under a different timestamp. Signatures travel as
//! `sha256=<lowercase hex>` in the `X-FormFlow-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

fn mac_for(secret: &str, timestamp: &str, payload: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    mac
}

/// Compute the signature header value for a webhook body.
pub fn sign(payload: &str, secret: &str, timestamp: &str) -> String {
    let digest = mac_for(secret, timestamp, payload).finalize().into_bytes();
    format!("{SIGNATURE_PREFIX}{}", hex::encode(digest))
}

/// Check a received signature in constant time.
///
/// Accepts the value with or without the `sha256=` prefix. Any mutation of
/// the payload, timestamp, secret or signature yields `false`.
pub fn verify_signature(payload: &str, secret: &str, timestamp: &str, signature: &str) -> bool {
    let hex_part = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    mac_for(secret, timestamp, payload)
        .verify_slice(&expected)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-05-01T12:00:00+00:00";

    #[test]
    fn signature_has_prefix_and_hex_digest() {
        let sig = sign(r#"{"event":"test"}"#, "secret", TS);
        let hex_part = sig.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signing_is_deterministic() {
        assert_eq!(sign("payload", "secret", TS), sign("payload", "secret", TS));
    }

    #[test]
    fn verify_accepts_own_signature() {
        let sig = sign("payload", "secret", TS);
        assert!(verify_signature("payload", "secret", TS, &sig));
    }

    #[test]
    fn verify_accepts_bare_hex() {
        let sig = sign("payload", "secret", TS);
        let bare = sig.trim_start_matches(SIGNATURE_PREFIX);
        assert!(verify_signature("payload", "secret", TS, bare));
    }

    #[test]
    fn verify_rejects_mutated_payload() {
        let sig = sign("payload", "secret", TS);
        assert!(!verify_signature("payload ", "secret", TS, &sig));
        assert!(!verify_signature("Payload", "secret", TS, &sig));
    }

    #[test]
    fn verify_rejects_mutated_timestamp() {
        let sig = sign("payload", "secret", TS);
        assert!(!verify_signature("payload", "secret", "2024-05-01T12:00:01+00:00", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret_and_garbage() {
        let sig = sign("payload", "secret", TS);
        assert!(!verify_signature("payload", "other", TS, &sig));
        assert!(!verify_signature("payload", "secret", TS, "sha256=zz"));
        assert!(!verify_signature("payload", "secret", TS, ""));
    }

    #[test]
    fn signature_covers_timestamp_prefix() {
        let with_ts = sign("payload", "secret", TS);
        let without_ts = sign("payload", "secret", "");
        assert_ne!(with_ts, without_ts);
    }
}
