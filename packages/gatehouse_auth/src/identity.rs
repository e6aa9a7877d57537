//! Who a connection belongs to.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Principal used when no authentication scheme is configured.
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Delivery pseudo-principal meaning "every authenticated connection".
pub const AUTHENTICATED: &str = "AUTHENTICATED";

const SESSION_ID_LEN: usize = 45;

/// The result of a successful authentication.
///
/// Serialized with the short field names clients and stored session files
/// already use (`upn`, `session`); any additional caller-supplied pairs are
/// flattened alongside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "upn")]
    pub user_principal: String,
    #[serde(rename = "session")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Identity {
    pub fn new(user_principal: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_principal: user_principal.into(),
            session_id: session_id.into(),
            ip_address: String::new(),
            extra: BTreeMap::new(),
        }
    }

    /// A fresh anonymous identity with a newly generated session id.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, generate_session_id())
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_principal == ANONYMOUS
    }
}

/// A new opaque session id: 45 characters of base64 over 256 random bits.
pub fn generate_session_id() -> String {
    let raw = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let mut id = STANDARD.encode(raw);
    id.truncate(SESSION_ID_LEN);
    id
}
