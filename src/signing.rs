//! HMAC-SHA256 request signing.
//!
//! A subscription secret never crosses the wire. The engine signs
//! `"{timestamp}.{body}"` and sends the hex digest as
//! `X-Webhook-Signature: sha256=<hex>` next to `X-Webhook-Timestamp`.
//! Receivers recompute the digest with their copy of the secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Header pairs to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature: (&'static str, String),
    pub timestamp: (&'static str, String),
}

/// Sign `body` with `secret` at `timestamp_secs`.
pub fn build_signature_headers(secret: &str, body: &[u8], timestamp_secs: i64) -> SignatureHeaders {
    let timestamp = timestamp_secs.to_string();
    let signature = compute_signature(secret.as_bytes(), &timestamp, body);
    SignatureHeaders {
        signature: (SIGNATURE_HEADER, format!("{SIGNATURE_PREFIX}{signature}")),
        timestamp: (TIMESTAMP_HEADER, timestamp),
    }
}

/// Hex-encoded HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn compute_signature(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a received signature. Accepts the digest with or
/// without the `sha256=` prefix.
pub fn verify_signature(secret: &[u8], timestamp: &str, body: &[u8], signature: &str) -> bool {
    let digest = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };

    let mut mac = new_mac(secret);
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(secret: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Receiver-side replay guard.
pub fn is_timestamp_fresh(timestamp_secs: i64, now_secs: i64, max_age_secs: i64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call, for subscribers written
/// in Rust.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    max_age_secs: i64,
    now_secs: i64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<i64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, timestamp_str, body, signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
