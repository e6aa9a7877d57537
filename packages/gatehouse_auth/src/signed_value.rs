//! Tamper-evident values for cookies and client-side storage.
//!
//! Format: `base64(value)|timestamp|signature`, where `timestamp` is Unix
//! seconds and `signature` is the hex HMAC-SHA1 of
//! `name ‖ base64(value) ‖ timestamp` under the server secret. Binding the
//! name means a value signed for one cookie cannot be replayed as another.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::api::{constant_time_eq, hmac_sha1_hex};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Values stamped further than this into the future are rejected.
const MAX_FUTURE_SKEW_SECS: i64 = 31 * SECS_PER_DAY;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignedValueError {
    #[error("signed value is malformed")]
    Malformed,
    #[error("signed value has an invalid signature")]
    BadSignature,
    #[error("signed value has expired")]
    Expired,
    #[error("signed value is timestamped in the future")]
    FromFuture,
    #[error("signed value payload is not valid base64 UTF-8")]
    Encoding,
}

fn signature(secret: &str, name: &str, encoded: &str, timestamp: &str) -> String {
    hmac_sha1_hex(
        secret.as_bytes(),
        &[name.as_bytes(), encoded.as_bytes(), timestamp.as_bytes()],
    )
}

/// Sign `value` under `name`, stamped with `now_secs`.
pub fn create_signed_value(secret: &str, name: &str, value: &str, now_secs: i64) -> String {
    let encoded = STANDARD.encode(value);
    let timestamp = now_secs.to_string();
    let sig = signature(secret, name, &encoded, &timestamp);
    format!("{encoded}|{timestamp}|{sig}")
}

/// Verify and unwrap a value produced by [`create_signed_value`].
pub fn decode_signed_value(
    secret: &str,
    name: &str,
    signed: &str,
    max_age_days: u32,
    now_secs: i64,
) -> Result<String, SignedValueError> {
    let parts: Vec<&str> = signed.trim().split('|').collect();
    let [encoded, timestamp, sig] = parts.as_slice() else {
        return Err(SignedValueError::Malformed);
    };

    let expected = signature(secret, name, encoded, timestamp);
    if !constant_time_eq(&expected, sig) {
        return Err(SignedValueError::BadSignature);
    }

    // Leading zeros would let an attacker shift bytes between the payload
    // and the timestamp without changing the signed concatenation.
    if timestamp.starts_with('0') {
        return Err(SignedValueError::Malformed);
    }
    let stamped: i64 = timestamp.parse().map_err(|_| SignedValueError::Malformed)?;
    if stamped < now_secs - i64::from(max_age_days) * SECS_PER_DAY {
        return Err(SignedValueError::Expired);
    }
    if stamped > now_secs + MAX_FUTURE_SKEW_SECS {
        return Err(SignedValueError::FromFuture);
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| SignedValueError::Encoding)?;
    String::from_utf8(bytes).map_err(|_| SignedValueError::Encoding)
}
