//! Out-of-band ("API") authentication.
//!
//! An embedding application that shares a secret with the server signs
//! `api_key ‖ upn ‖ timestamp` and hands the client an object like:
//!
//! ```text
//! {
//!   "api_key": "MjkwYzc3MDI2MjhhNGZkNDg1MjJkODgyYjBmN2MyMTM4M",
//!   "upn": "joe@company.com",
//!   "timestamp": "1323391717238",
//!   "signature": "<hex HMAC-SHA1>",
//!   "signature_method": "HMAC-SHA1",
//!   "api_version": "1.0"
//! }
//! ```
//!
//! The timestamp is milliseconds since the Unix epoch. Any other keys are
//! carried through to `Identity::extra`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{Map, Value};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::AuthError;
use crate::replay::SignatureRecord;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const SUPPORTED_API_VERSION: &str = "1.0";

const KNOWN_FIELDS: [&str; 6] = [
    "api_key",
    "api_version",
    "timestamp",
    "upn",
    "signature",
    "signature_method",
];

/// Lowercase hex HMAC-SHA1 of `parts` fed in order.
pub(crate) fn hmac_sha1_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Lowercase hex HMAC-SHA1 of the raw concatenation `api_key ‖ upn ‖ timestamp`.
pub fn sign_api_request(secret: &str, api_key: &str, upn: &str, timestamp: &str) -> String {
    hmac_sha1_hex(
        secret.as_bytes(),
        &[api_key.as_bytes(), upn.as_bytes(), timestamp.as_bytes()],
    )
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh `(api_key, secret)` pair for an embedding application.
pub fn generate_api_key() -> (String, String) {
    (random_token(), random_token())
}

/// A decoded API authentication object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredential {
    pub api_key: String,
    pub upn: String,
    /// Kept verbatim: the signature covers the textual form.
    pub timestamp: String,
    pub signature: String,
    pub signature_method: String,
    pub api_version: String,
    /// Caller-supplied pairs outside the protocol fields.
    pub extra: BTreeMap<String, String>,
}

impl ApiCredential {
    pub fn from_value(value: &Value) -> Result<Self, AuthError> {
        let Value::Object(obj) = value else {
            return Err(AuthError::MalformedCredential(
                "authentication object must be a JSON object".into(),
            ));
        };
        Self::from_map(obj)
    }

    pub fn from_map(obj: &Map<String, Value>) -> Result<Self, AuthError> {
        if !obj.contains_key("api_key") {
            return Err(AuthError::Unauthenticated(
                "missing api_key in authentication object".into(),
            ));
        }
        let field = |name: &str| -> Result<String, AuthError> {
            match obj.get(name) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Number(n)) => Ok(n.to_string()),
                Some(_) => Err(AuthError::MalformedCredential(format!(
                    "{name} must be a string"
                ))),
                None => Err(AuthError::MalformedCredential(format!("missing {name}"))),
            }
        };

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect();

        Ok(Self {
            api_key: field("api_key")?,
            upn: field("upn")?,
            timestamp: field("timestamp")?,
            signature: field("signature")?,
            signature_method: field("signature_method")?,
            api_version: field("api_version")?,
            extra,
        })
    }

    /// Run the validation sequence and record the signature on success.
    ///
    /// On any failure `seen` is left holding only what it held before
    /// (minus entries whose window has closed).
    pub fn validate(
        &self,
        api_keys: &HashMap<String, String>,
        seen: &mut SignatureRecord,
        window: Duration,
        now_ms: i64,
    ) -> Result<(), AuthError> {
        let expires_at_ms = self.check(api_keys, seen, window, now_ms)?;
        self.record(seen, expires_at_ms);
        Ok(())
    }

    /// Run the validation sequence, short-circuiting at the first failure,
    /// without recording the signature.
    ///
    /// Returns how long the signature must be remembered once the caller
    /// commits to accepting it with [`record`](Self::record).
    pub fn check(
        &self,
        api_keys: &HashMap<String, String>,
        seen: &mut SignatureRecord,
        window: Duration,
        now_ms: i64,
    ) -> Result<i64, AuthError> {
        if self.signature_method != SIGNATURE_METHOD {
            return Err(AuthError::UnsupportedMethod(self.signature_method.clone()));
        }
        if self.api_version != SUPPORTED_API_VERSION {
            return Err(AuthError::UnsupportedVersion(self.api_version.clone()));
        }
        let secret = api_keys.get(&self.api_key).ok_or(AuthError::UnknownKey)?;

        let expected = sign_api_request(secret, &self.api_key, &self.upn, &self.timestamp);
        if !constant_time_eq(&expected, &self.signature) {
            return Err(AuthError::BadSignature);
        }

        seen.evict_expired(now_ms);
        if seen.contains(&self.signature) {
            return Err(AuthError::ReplayDetected);
        }

        let signed_at = self.timestamp_ms()?;
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_sub(signed_at) > window_ms {
            return Err(AuthError::Expired);
        }

        Ok(signed_at.saturating_add(window_ms).max(now_ms))
    }

    /// Mark this credential's signature as used until `expires_at_ms`.
    pub fn record(&self, seen: &mut SignatureRecord, expires_at_ms: i64) {
        seen.insert(&self.signature, expires_at_ms);
    }

    pub fn timestamp_ms(&self) -> Result<i64, AuthError> {
        self.timestamp.trim().parse().map_err(|_| {
            AuthError::MalformedCredential(format!(
                "timestamp {:?} is not milliseconds since the epoch",
                self.timestamp
            ))
        })
    }
}
