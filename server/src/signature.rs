//! Request signing checks for inbound Slack webhooks.
//!
//! Slack signs `v0:{timestamp}:{raw body}` with the app's signing secret and
//! sends the hex digest as `X-Slack-Signature: v0=<hex>`. Verification must
//! run over the bytes exactly as received.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Maximum distance between the request timestamp and local time.
pub const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("request timestamp is not a unix time")]
    MalformedTimestamp,

    #[error("request timestamp outside the replay window")]
    ReplayDetected,

    #[error("signature mismatch")]
    SignatureInvalid,
}

pub fn expected_signature(signing_secret: &str, timestamp: &str, body: &[u8]) -> Option<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(signing_secret.as_bytes()).ok()?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Some(format!("v0={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify(
    body: &[u8],
    signature: Option<&str>,
    timestamp: Option<&str>,
    signing_secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let signature = signature
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
    let timestamp = timestamp
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;

    let sent_at = timestamp
        .parse::<i64>()
        .map_err(|_| SignatureError::MalformedTimestamp)?;
    if now_unix.abs_diff(sent_at) > REPLAY_WINDOW_SECS.unsigned_abs() {
        return Err(SignatureError::ReplayDetected);
    }

    let expected = expected_signature(signing_secret, timestamp, body)
        .ok_or(SignatureError::SignatureInvalid)?;
    if expected.len() != signature.len() {
        return Err(SignatureError::SignatureInvalid);
    }
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::SignatureInvalid)
    }
}
