//! Connection authentication.
//!
//! Three mutually exclusive paths, picked by `auth.mode`:
//!
//! - `none`: everyone is `ANONYMOUS`. A client presenting a valid session
//!   token keeps its session id; anyone else gets a fresh one plus a token
//!   to store.
//! - `cookie`: a signed `gatehouse_user` cookie (or the same signed value
//!   passed as `auth`) carries the identity.
//! - `api`: an HMAC-signed authentication object from an embedding
//!   application, with replay protection.

use std::collections::HashMap;
use std::time::Duration;

use gatehouse_auth::{
    ApiCredential, AuthError, Identity, SignatureRecord, create_signed_value, decode_signed_value,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::{AuthConfig, AuthMode};
use crate::user_store::UserStore;

/// Name the identity cookie and anonymous session tokens are signed under.
pub const USER_COOKIE: &str = "gatehouse_user";

/// Argument of the `authenticate` command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthRequest {
    /// A signed session token (string) or an API authentication object.
    #[serde(default)]
    pub auth: Option<Value>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Transport-level facts about the connection being authenticated.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Raw value of the `gatehouse_user` cookie, if the upgrade carried one.
    pub cookie: Option<String>,
    pub ip_address: String,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authenticated {
    pub identity: Identity,
    /// Set when a fresh anonymous identity was minted; the client should
    /// store it and present it as `auth` next time.
    pub session_token: Option<String>,
}

pub struct Authenticator {
    mode: AuthMode,
    cookie_secret: String,
    cookie_max_age_days: u32,
    api_keys: HashMap<String, String>,
    api_window: Duration,
    users: UserStore,
    seen: Mutex<SignatureRecord>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, users: UserStore) -> Self {
        Self {
            mode: config.mode,
            cookie_secret: config.cookie_secret.clone(),
            cookie_max_age_days: config.cookie_max_age_days,
            api_keys: config.api_keys.clone(),
            api_window: config.api_timestamp_window,
            users,
            seen: Mutex::new(SignatureRecord::new()),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn authenticate(
        &self,
        request: &AuthRequest,
        ctx: &RequestContext,
    ) -> Result<Authenticated, AuthError> {
        self.authenticate_at(request, ctx, chrono::Utc::now().timestamp_millis())
    }

    pub fn authenticate_at(
        &self,
        request: &AuthRequest,
        ctx: &RequestContext,
        now_ms: i64,
    ) -> Result<Authenticated, AuthError> {
        let result = match (self.mode, &request.auth) {
            (AuthMode::Api, Some(Value::Object(obj))) => self.api(obj, ctx, now_ms),
            (AuthMode::None | AuthMode::Cookie, Some(Value::Object(_))) => {
                Err(AuthError::ApiNotConfigured)
            }
            (AuthMode::None, auth) => self.anonymous(auth.as_ref(), ctx, now_ms),
            (AuthMode::Cookie | AuthMode::Api, auth) => self.cookie(auth.as_ref(), ctx, now_ms),
        };

        match &result {
            Err(e) if e.is_security_event() => error!(
                error_code = e.error_code(),
                ip = %ctx.ip_address,
                origin = ctx.origin.as_deref().unwrap_or("-"),
                upn = request_principal(request).unwrap_or("-"),
                "AUTH FAILED: {e}"
            ),
            Err(e) => debug!(error_code = e.error_code(), ip = %ctx.ip_address, "Authentication failed: {e}"),
            Ok(_) => {}
        }
        result
    }

    /// Number of signatures currently held for replay detection.
    pub fn replay_cache_len(&self) -> usize {
        self.seen.lock().len()
    }

    fn api(
        &self,
        obj: &serde_json::Map<String, Value>,
        ctx: &RequestContext,
        now_ms: i64,
    ) -> Result<Authenticated, AuthError> {
        let credential = ApiCredential::from_map(obj)?;

        // Held until the outcome is known so a concurrent replay cannot slip
        // in between the check and the record.
        let mut seen = self.seen.lock();
        let expires_at_ms = credential.check(&self.api_keys, &mut seen, self.api_window, now_ms)?;
        crate::user_store::validate_principal(&credential.upn)
            .map_err(|e| AuthError::MalformedCredential(e.to_string()))?;

        let stored = self.users.load_or_create(&credential.upn).map_err(|e| {
            warn!(upn = %credential.upn, error = %e, "Failed to load session file");
            AuthError::Storage(format!("{e:#}"))
        })?;
        credential.record(&mut seen, expires_at_ms);
        drop(seen);

        let mut identity = Identity::new(credential.upn, stored.session).with_ip(&ctx.ip_address);
        identity.extra = credential.extra;
        Ok(Authenticated {
            identity,
            session_token: None,
        })
    }

    fn cookie(
        &self,
        auth: Option<&Value>,
        ctx: &RequestContext,
        now_ms: i64,
    ) -> Result<Authenticated, AuthError> {
        let signed = match auth {
            Some(Value::String(s)) if !s.is_empty() => s.as_str(),
            _ => ctx
                .cookie
                .as_deref()
                .ok_or_else(|| AuthError::Unauthenticated("no identity cookie".into()))?,
        };
        let identity = self
            .decode_identity(signed, now_ms)
            .ok_or_else(|| AuthError::Unauthenticated("invalid or expired identity cookie".into()))?;
        if identity.is_anonymous() {
            return Err(AuthError::Unauthenticated(
                "anonymous identity presented to an authenticating server".into(),
            ));
        }
        Ok(Authenticated {
            identity: identity.with_ip(&ctx.ip_address),
            session_token: None,
        })
    }

    fn anonymous(
        &self,
        auth: Option<&Value>,
        ctx: &RequestContext,
        now_ms: i64,
    ) -> Result<Authenticated, AuthError> {
        let presented = match auth {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => ctx.cookie.as_deref(),
        };
        if let Some(identity) = presented.and_then(|s| self.decode_identity(s, now_ms)) {
            if !identity.is_anonymous() {
                return Err(AuthError::Unauthenticated(
                    "named identity presented to an anonymous server".into(),
                ));
            }
            return Ok(Authenticated {
                identity: identity.with_ip(&ctx.ip_address),
                session_token: None,
            });
        }

        let identity = Identity::anonymous();
        let token = self.session_token(&identity, now_ms);
        Ok(Authenticated {
            identity: identity.with_ip(&ctx.ip_address),
            session_token: Some(token),
        })
    }

    /// Sign `identity` (without its IP) for client-side storage.
    pub fn session_token(&self, identity: &Identity, now_ms: i64) -> String {
        let mut portable = identity.clone();
        portable.ip_address.clear();
        let payload = serde_json::to_string(&portable).unwrap_or_default();
        create_signed_value(&self.cookie_secret, USER_COOKIE, &payload, now_ms / 1000)
    }

    fn decode_identity(&self, signed: &str, now_ms: i64) -> Option<Identity> {
        let payload = decode_signed_value(
            &self.cookie_secret,
            USER_COOKIE,
            signed,
            self.cookie_max_age_days,
            now_ms / 1000,
        )
        .map_err(|e| debug!(error = %e, "Rejected signed identity"))
        .ok()?;
        serde_json::from_str(&payload)
            .map_err(|e| debug!(error = %e, "Signed identity is not an identity"))
            .ok()
    }
}

fn request_principal(request: &AuthRequest) -> Option<&str> {
    request.auth.as_ref()?.get("upn")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_auth::{ANONYMOUS, AuthResponse, sign_api_request};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn config(mode: AuthMode) -> AuthConfig {
        AuthConfig {
            mode,
            cookie_secret: "cookie-secret".into(),
            cookie_max_age_days: 31,
            api_timestamp_window: Duration::from_secs(30),
            api_keys: HashMap::from([("K1".to_string(), "S1".to_string())]),
        }
    }

    fn authenticator(mode: AuthMode) -> (Authenticator, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(&config(mode), UserStore::new(tmp.path()));
        (auth, tmp)
    }

    fn api_request(upn: &str, ts: i64) -> AuthRequest {
        let timestamp = ts.to_string();
        AuthRequest {
            auth: Some(json!({
                "api_key": "K1",
                "upn": upn,
                "timestamp": timestamp,
                "signature": sign_api_request("S1", "K1", upn, &timestamp),
                "signature_method": "HMAC-SHA1",
                "api_version": "1.0",
            })),
            ..Default::default()
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            ip_address: "10.0.0.7".into(),
            ..Default::default()
        }
    }

    // ── api ─────────────────────────────────────────────────────────────

    #[test]
    fn api_success_then_replay() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let req = api_request("alice", NOW);

        let ok = auth.authenticate_at(&req, &ctx(), NOW).unwrap();
        assert_eq!(ok.identity.user_principal, "alice");
        assert!(!ok.identity.session_id.is_empty());
        assert_eq!(ok.identity.ip_address, "10.0.0.7");
        assert!(ok.session_token.is_none());

        let err = auth.authenticate_at(&req, &ctx(), NOW + 10).unwrap_err();
        assert_eq!(err, AuthError::ReplayDetected);
        assert!(matches!(err.response(), AuthResponse::Close { .. }));
    }

    #[test]
    fn api_same_principal_same_session() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let a = auth
            .authenticate_at(&api_request("alice", NOW), &ctx(), NOW)
            .unwrap();
        let b = auth
            .authenticate_at(&api_request("alice", NOW + 1_000), &ctx(), NOW + 1_000)
            .unwrap();
        assert_eq!(a.identity.session_id, b.identity.session_id);
    }

    #[test]
    fn api_expired_keeps_connection() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let err = auth
            .authenticate_at(&api_request("alice", NOW - 60_000), &ctx(), NOW)
            .unwrap_err();
        assert_eq!(err, AuthError::Expired);
        assert_eq!(err.response(), AuthResponse::Reauthenticate);
        assert_eq!(auth.replay_cache_len(), 0);
    }

    #[test]
    fn api_extra_fields_reach_identity() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let mut req = api_request("alice", NOW);
        if let Some(Value::Object(obj)) = req.auth.as_mut() {
            obj.insert("department".into(), json!("ops"));
        }
        let ok = auth.authenticate_at(&req, &ctx(), NOW).unwrap();
        assert_eq!(ok.identity.extra.get("department").map(String::as_str), Some("ops"));
    }

    #[test]
    fn api_rejects_path_like_principal() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let err = auth
            .authenticate_at(&api_request("../../etc", NOW), &ctx(), NOW)
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedCredential(_)));
    }

    #[test]
    fn api_bad_signature_outranks_bad_principal() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let mut req = api_request("alice", NOW);
        if let Some(Value::Object(obj)) = req.auth.as_mut() {
            obj.insert("upn".into(), json!("../../etc"));
        }
        let err = auth.authenticate_at(&req, &ctx(), NOW).unwrap_err();
        assert_eq!(err, AuthError::BadSignature);
    }

    #[test]
    fn api_storage_failure_keeps_signature_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("users");
        std::fs::write(&user_dir, "not a directory").unwrap();
        let auth = Authenticator::new(&config(AuthMode::Api), UserStore::new(&user_dir));
        let req = api_request("alice", NOW);

        let err = auth.authenticate_at(&req, &ctx(), NOW).unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));
        assert_eq!(auth.replay_cache_len(), 0);

        std::fs::remove_file(&user_dir).unwrap();
        let ok = auth.authenticate_at(&req, &ctx(), NOW + 1_000).unwrap();
        assert_eq!(ok.identity.user_principal, "alice");
        assert_eq!(auth.replay_cache_len(), 1);
        assert_eq!(
            auth.authenticate_at(&req, &ctx(), NOW + 2_000),
            Err(AuthError::ReplayDetected)
        );
    }

    #[test]
    fn api_object_without_api_mode() {
        let (auth, _tmp) = authenticator(AuthMode::None);
        let err = auth
            .authenticate_at(&api_request("alice", NOW), &ctx(), NOW)
            .unwrap_err();
        assert_eq!(err, AuthError::ApiNotConfigured);
    }

    // ── anonymous ───────────────────────────────────────────────────────

    #[test]
    fn anonymous_mints_and_reuses_session() {
        let (auth, _tmp) = authenticator(AuthMode::None);
        let first = auth
            .authenticate_at(&AuthRequest::default(), &ctx(), NOW)
            .unwrap();
        assert_eq!(first.identity.user_principal, ANONYMOUS);
        let token = first.session_token.clone().unwrap();

        let again = AuthRequest {
            auth: Some(json!(token)),
            ..Default::default()
        };
        let second = auth.authenticate_at(&again, &ctx(), NOW + 5_000).unwrap();
        assert_eq!(second.identity.session_id, first.identity.session_id);
        assert!(second.session_token.is_none());
    }

    #[test]
    fn anonymous_ignores_garbage_token() {
        let (auth, _tmp) = authenticator(AuthMode::None);
        let req = AuthRequest {
            auth: Some(json!("garbage|token|here")),
            ..Default::default()
        };
        let ok = auth.authenticate_at(&req, &ctx(), NOW).unwrap();
        assert!(ok.identity.is_anonymous());
        assert!(ok.session_token.is_some());
    }

    #[test]
    fn anonymous_server_rejects_named_identity() {
        let (auth, _tmp) = authenticator(AuthMode::None);
        let token = auth.session_token(&Identity::new("alice", "s1"), NOW);
        let req = AuthRequest {
            auth: Some(json!(token)),
            ..Default::default()
        };
        assert!(matches!(
            auth.authenticate_at(&req, &ctx(), NOW),
            Err(AuthError::Unauthenticated(_))
        ));
    }

    // ── cookie ──────────────────────────────────────────────────────────

    #[test]
    fn cookie_missing_is_unauthenticated() {
        let (auth, _tmp) = authenticator(AuthMode::Cookie);
        let err = auth
            .authenticate_at(&AuthRequest::default(), &ctx(), NOW)
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
        assert_eq!(err.response(), AuthResponse::Reauthenticate);
    }

    #[test]
    fn cookie_valid_identity() {
        let (auth, _tmp) = authenticator(AuthMode::Cookie);
        let cookie = auth.session_token(&Identity::new("alice", "s-alice"), NOW);
        let ctx = RequestContext {
            cookie: Some(cookie),
            ..ctx()
        };
        let ok = auth
            .authenticate_at(&AuthRequest::default(), &ctx, NOW)
            .unwrap();
        assert_eq!(ok.identity.user_principal, "alice");
        assert_eq!(ok.identity.session_id, "s-alice");
        assert_eq!(ok.identity.ip_address, "10.0.0.7");
    }

    #[test]
    fn cookie_rejects_anonymous_and_forged() {
        let (auth, _tmp) = authenticator(AuthMode::Cookie);
        let anon = auth.session_token(&Identity::anonymous(), NOW);
        let forged = create_signed_value(
            "wrong-secret",
            USER_COOKIE,
            r#"{"upn":"admin","session":"x"}"#,
            NOW / 1000,
        );
        for cookie in [anon, forged] {
            let ctx = RequestContext {
                cookie: Some(cookie),
                ..ctx()
            };
            assert!(matches!(
                auth.authenticate_at(&AuthRequest::default(), &ctx, NOW),
                Err(AuthError::Unauthenticated(_))
            ));
        }
    }

    #[test]
    fn cookie_expires_after_max_age() {
        let (auth, _tmp) = authenticator(AuthMode::Cookie);
        let cookie = auth.session_token(&Identity::new("alice", "s"), NOW);
        let ctx = RequestContext {
            cookie: Some(cookie),
            ..ctx()
        };
        let later = NOW + 32 * 86_400 * 1000;
        assert!(auth
            .authenticate_at(&AuthRequest::default(), &ctx, later)
            .is_err());
    }

    #[test]
    fn api_mode_falls_back_to_cookie_for_non_objects() {
        let (auth, _tmp) = authenticator(AuthMode::Api);
        let token = auth.session_token(&Identity::new("alice", "s-alice"), NOW);
        let req = AuthRequest {
            auth: Some(json!(token)),
            ..Default::default()
        };
        let ok = auth.authenticate_at(&req, &ctx(), NOW).unwrap();
        assert_eq!(ok.identity.session_id, "s-alice");
    }
}
