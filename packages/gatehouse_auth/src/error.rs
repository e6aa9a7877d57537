//! Authentication failures and the user-visible reaction each one calls for.

use serde::{Deserialize, Serialize};

/// What the connection layer should do after a failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuthResponse {
    /// Tell the client to re-authenticate; the connection stays open.
    Reauthenticate,
    /// Show the client a notice; the connection stays open.
    Notice { text: String },
    /// Show the client a notice, then close the connection.
    Close { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("replay detected")]
    ReplayDetected,

    #[error("unsupported signature method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported api version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown api key")]
    UnknownKey,

    #[error("bad signature")]
    BadSignature,

    #[error("authentication object expired")]
    Expired,

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("api authentication is not enabled on this server")]
    ApiNotConfigured,

    #[error("session storage failed: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::ReplayDetected => "replay_detected",
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::UnknownKey => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::MalformedCredential(_) => "malformed_credential",
            Self::ApiNotConfigured => "api_not_configured",
            Self::Storage(_) => "storage",
        }
    }

    /// Only a replayed signature indicates an active attack; everything else
    /// is treated as a benign race or misconfiguration.
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::ReplayDetected)
    }

    pub fn response(&self) -> AuthResponse {
        match self {
            Self::ReplayDetected => AuthResponse::Close {
                text: "AUTH FAILED: Replay attack detected!  This event has been logged.".into(),
            },
            Self::ApiNotConfigured => AuthResponse::Notice {
                text: "AUTHENTICATION ERROR: Server is not configured to perform API-based \
                       authentication."
                    .into(),
            },
            Self::Storage(_) => AuthResponse::Notice {
                text: "AUTHENTICATION ERROR: User unknown".into(),
            },
            Self::Unauthenticated(_)
            | Self::UnsupportedMethod(_)
            | Self::UnsupportedVersion(_)
            | Self::UnknownKey
            | Self::BadSignature
            | Self::Expired
            | Self::MalformedCredential(_) => AuthResponse::Reauthenticate,
        }
    }
}

/// Serializable error body for HTTP callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub response: AuthResponse,
}

impl From<&AuthError> for ErrorResponse {
    fn from(err: &AuthError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            response: err.response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(AuthError::ReplayDetected.error_code(), "replay_detected");
        assert_eq!(AuthError::Expired.error_code(), "expired");
        assert_eq!(
            AuthError::UnsupportedMethod("HMAC-MD5".into()).error_code(),
            "unsupported_method"
        );
    }

    #[test]
    fn only_replay_closes_the_connection() {
        let all = [
            AuthError::Unauthenticated("no cookie".into()),
            AuthError::UnsupportedMethod("x".into()),
            AuthError::UnsupportedVersion("2.0".into()),
            AuthError::UnknownKey,
            AuthError::BadSignature,
            AuthError::Expired,
            AuthError::MalformedCredential("upn".into()),
            AuthError::ApiNotConfigured,
            AuthError::Storage("disk full".into()),
        ];
        for err in &all {
            assert!(
                !matches!(err.response(), AuthResponse::Close { .. }),
                "{err} should keep the connection open"
            );
            assert!(!err.is_security_event());
        }
        assert!(matches!(
            AuthError::ReplayDetected.response(),
            AuthResponse::Close { .. }
        ));
        assert!(AuthError::ReplayDetected.is_security_event());
    }

    #[test]
    fn signature_failures_ask_for_reauthentication() {
        assert_eq!(AuthError::BadSignature.response(), AuthResponse::Reauthenticate);
        assert_eq!(AuthError::Expired.response(), AuthResponse::Reauthenticate);
        assert_eq!(AuthError::UnknownKey.response(), AuthResponse::Reauthenticate);
    }

    #[test]
    fn error_response_serde() {
        let resp = ErrorResponse::from(&AuthError::ReplayDetected);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"action\":\"close\""));
        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, "replay_detected");
    }
}
