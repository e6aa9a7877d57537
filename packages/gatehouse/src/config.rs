use anyhow::{Context, Result};
use gatehouse_auth::parse_duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [auth]
//                    mode = "api"
//
//   env var:         GATEHOUSE_AUTH__MODE=api   (double underscore = nesting)
//
//   (single underscore stays within field names: GATEHOUSE_SESSIONS__SESSION_TIMEOUT)

/// How connections prove who they are.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Everyone is `ANONYMOUS`; session ids are minted per browser.
    #[default]
    None,
    /// A signed `gatehouse_user` cookie set by a fronting login flow.
    Cookie,
    /// HMAC-signed authentication objects from an embedding application.
    Api,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
    #[serde(default)]
    pub policy: PolicyFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed WebSocket origins; `"*"` allows any.
    #[serde(default = "default_origins")]
    pub origins: Vec<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            origins: default_origins(),
        }
    }
}

/// Auth-related tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub cookie_secret: Option<String>,
    #[serde(default = "default_cookie_max_age_days")]
    pub cookie_max_age_days: u32,
    #[serde(default = "default_api_timestamp_window")]
    pub api_timestamp_window: String,
    /// `api_key -> shared secret`
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::None,
            cookie_secret: None,
            cookie_max_age_days: default_cookie_max_age_days(),
            api_timestamp_window: default_api_timestamp_window(),
            api_keys: HashMap::new(),
        }
    }
}

/// Session lifecycle tunables (lives under `[sessions]` in config.toml).
///
/// Paths left unset are derived from the data directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    #[serde(default = "default_session_timeout")]
    pub session_timeout: String,
    #[serde(default = "default_session_timeout_check_interval")]
    pub session_timeout_check_interval: String,
    #[serde(default)]
    pub user_dir: Option<PathBuf>,
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    #[serde(default)]
    pub broadcast_file: Option<PathBuf>,
    #[serde(default = "default_file_check_interval")]
    pub file_check_interval: String,
    #[serde(default = "default_user_logs_max_age")]
    pub user_logs_max_age: String,
    #[serde(default = "default_user_logs_cleanup_interval")]
    pub user_logs_cleanup_interval: String,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            session_timeout: default_session_timeout(),
            session_timeout_check_interval: default_session_timeout_check_interval(),
            user_dir: None,
            session_dir: None,
            broadcast_file: None,
            file_check_interval: default_file_check_interval(),
            user_logs_max_age: default_user_logs_max_age(),
            user_logs_cleanup_interval: default_user_logs_cleanup_interval(),
        }
    }
}

/// What authenticated users may do (lives under `[policy]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyFileConfig {
    #[serde(default = "default_true")]
    pub send_user_messages: bool,
    #[serde(default = "default_true")]
    pub send_broadcasts: bool,
}

impl Default for PolicyFileConfig {
    fn default() -> Self {
        Self {
            send_user_messages: true,
            send_broadcasts: true,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_origins() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}
fn default_cookie_max_age_days() -> u32 {
    31
}
fn default_api_timestamp_window() -> String {
    "30s".to_string()
}
fn default_session_timeout() -> String {
    "5d".to_string()
}
fn default_session_timeout_check_interval() -> String {
    "30s".to_string()
}
fn default_file_check_interval() -> String {
    "5s".to_string()
}
fn default_user_logs_max_age() -> String {
    "30d".to_string()
}
fn default_user_logs_cleanup_interval() -> String {
    "5m".to_string()
}
fn default_true() -> bool {
    true
}

/// Build a figment that layers: defaults → config.toml → GATEHOUSE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `GATEHOUSE_AUTH__MODE=api`  →  `auth.mode = "api"`
///   `GATEHOUSE_SERVER__PORT=9000`  →  `server.port = 9000`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("GATEHOUSE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            origins: fc.origins.iter().map(|o| o.to_lowercase()).collect(),
        }
    }

    /// Check a browser `Origin` header against the allow-list.
    ///
    /// The scheme is ignored; an entry matches either the full `host:port`
    /// or the bare host. A missing origin only passes under `"*"`.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.origins.iter().any(|o| o == "*") {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.trim().to_lowercase();
        let short = origin
            .split_once("://")
            .map_or(origin.as_str(), |(_, rest)| rest)
            .trim_end_matches('/');
        let host = match short.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => short,
        };
        self.origins.iter().any(|o| o == short || o == host)
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Key for the `gatehouse_user` cookie and anonymous session tokens.
    pub cookie_secret: String,
    pub cookie_max_age_days: u32,
    pub api_timestamp_window: Duration,
    pub api_keys: HashMap<String, String>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Result<Self> {
        let cookie_secret = match fc.cookie_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret.to_string(),
            _ => {
                warn!(
                    "No auth.cookie_secret configured; generated an ephemeral one. \
                     Signed cookies and session tokens will not survive a restart."
                );
                gatehouse_auth::generate_api_key().1
            }
        };
        if fc.mode == AuthMode::Api && fc.api_keys.is_empty() {
            warn!("auth.mode = \"api\" but no auth.api_keys are configured");
        }
        Ok(Self {
            mode: fc.mode,
            cookie_secret,
            cookie_max_age_days: fc.cookie_max_age_days,
            api_timestamp_window: duration_setting(
                "auth.api_timestamp_window",
                &fc.api_timestamp_window,
            )?,
            api_keys: fc.api_keys.clone(),
        })
    }
}

/// Session lifecycle configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub session_timeout_check_interval: Duration,
    pub user_dir: PathBuf,
    pub session_dir: PathBuf,
    pub broadcast_file: PathBuf,
    pub file_check_interval: Duration,
    pub user_logs_max_age: Duration,
    pub user_logs_cleanup_interval: Duration,
}

impl SessionConfig {
    pub fn from_file(fc: &SessionsFileConfig, data_dir: &Path) -> Result<Self> {
        let user_dir = fc.user_dir.clone().unwrap_or_else(|| data_dir.join("users"));
        let session_dir = fc
            .session_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("sessions"));
        let broadcast_file = fc
            .broadcast_file
            .clone()
            .unwrap_or_else(|| session_dir.join("broadcast"));
        Ok(Self {
            session_timeout: duration_setting("sessions.session_timeout", &fc.session_timeout)?,
            session_timeout_check_interval: nonzero_interval(
                "sessions.session_timeout_check_interval",
                &fc.session_timeout_check_interval,
            )?,
            user_dir,
            session_dir,
            broadcast_file,
            file_check_interval: nonzero_interval(
                "sessions.file_check_interval",
                &fc.file_check_interval,
            )?,
            user_logs_max_age: duration_setting(
                "sessions.user_logs_max_age",
                &fc.user_logs_max_age,
            )?,
            user_logs_cleanup_interval: nonzero_interval(
                "sessions.user_logs_cleanup_interval",
                &fc.user_logs_cleanup_interval,
            )?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub send_user_messages: bool,
    pub send_broadcasts: bool,
}

impl PolicyConfig {
    pub fn from_file(fc: &PolicyFileConfig) -> Self {
        Self {
            send_user_messages: fc.send_user_messages,
            send_broadcasts: fc.send_broadcasts,
        }
    }
}

/// Everything the gateway core needs, validated.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sessions: SessionConfig,
    pub policy: PolicyConfig,
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig, data_dir: &Path) -> Result<Self> {
        Ok(Self {
            server: ServerConfig::from_file(&fc.server),
            auth: AuthConfig::from_file(&fc.auth)?,
            sessions: SessionConfig::from_file(&fc.sessions, data_dir)?,
            policy: PolicyConfig::from_file(&fc.policy),
        })
    }
}

fn duration_setting(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).with_context(|| format!("invalid duration for {key}: {value:?}"))
}

/// Periodic task intervals must be non-zero; tokio refuses a zero period.
fn nonzero_interval(key: &str, value: &str) -> Result<Duration> {
    let d = duration_setting(key, value)?;
    if d.is_zero() {
        anyhow::bail!("{key} must be greater than zero");
    }
    Ok(d)
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatehouseConfig {
    pub data_dir: PathBuf,
}

impl GatehouseConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".gatehouse"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 8000);
        assert_eq!(fc.auth.mode, AuthMode::None);
        assert_eq!(fc.auth.cookie_max_age_days, 31);
        assert_eq!(fc.auth.api_timestamp_window, "30s");
        assert_eq!(fc.sessions.session_timeout, "5d");
        assert_eq!(fc.sessions.file_check_interval, "5s");
        assert!(fc.policy.send_user_messages);
        assert!(fc.policy.send_broadcasts);
    }

    #[test]
    fn test_session_paths_derive_from_data_dir() {
        let sc = SessionConfig::from_file(&SessionsFileConfig::default(), Path::new("/srv/gh"))
            .unwrap();
        assert_eq!(sc.user_dir, Path::new("/srv/gh/users"));
        assert_eq!(sc.session_dir, Path::new("/srv/gh/sessions"));
        assert_eq!(sc.broadcast_file, Path::new("/srv/gh/sessions/broadcast"));
        assert_eq!(sc.session_timeout, Duration::from_secs(5 * 86_400));
        assert_eq!(sc.session_timeout_check_interval, Duration::from_secs(30));
        assert_eq!(sc.user_logs_cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_broadcast_file_follows_custom_session_dir() {
        let fc = SessionsFileConfig {
            session_dir: Some(PathBuf::from("/tmp/sess")),
            ..Default::default()
        };
        let sc = SessionConfig::from_file(&fc, Path::new("/srv/gh")).unwrap();
        assert_eq!(sc.broadcast_file, Path::new("/tmp/sess/broadcast"));
    }

    #[test]
    fn test_invalid_duration_names_the_key() {
        let fc = SessionsFileConfig {
            session_timeout: "five days".into(),
            ..Default::default()
        };
        let err = SessionConfig::from_file(&fc, Path::new("/x")).unwrap_err();
        assert!(format!("{err:#}").contains("sessions.session_timeout"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let fc = SessionsFileConfig {
            file_check_interval: "0s".into(),
            ..Default::default()
        };
        let err = SessionConfig::from_file(&fc, Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("sessions.file_check_interval"));
    }

    #[test]
    fn test_missing_cookie_secret_is_generated() {
        let a = AuthConfig::from_file(&AuthFileConfig::default()).unwrap();
        let b = AuthConfig::from_file(&AuthFileConfig::default()).unwrap();
        assert!(!a.cookie_secret.is_empty());
        assert_ne!(a.cookie_secret, b.cookie_secret);
        assert_eq!(a.api_timestamp_window, Duration::from_secs(30));
    }

    // ── origins ─────────────────────────────────────────────────────────

    #[test]
    fn test_origin_check() {
        let sc = ServerConfig::from_file(&ServerFileConfig::default());
        assert!(sc.origin_allowed(Some("http://localhost:8000")));
        assert!(sc.origin_allowed(Some("https://LOCALHOST")));
        assert!(sc.origin_allowed(Some("http://127.0.0.1:8000/")));
        assert!(!sc.origin_allowed(Some("https://evil.example.com")));
        assert!(!sc.origin_allowed(None));
    }

    #[test]
    fn test_origin_exact_host_port_entry() {
        let sc = ServerConfig::from_file(&ServerFileConfig {
            origins: vec!["Term.Example.com:8443".into()],
            ..Default::default()
        });
        assert!(sc.origin_allowed(Some("https://term.example.com:8443")));
        assert!(!sc.origin_allowed(Some("https://term.example.com:9999")));
    }

    #[test]
    fn test_wildcard_origin() {
        let sc = ServerConfig::from_file(&ServerFileConfig {
            origins: vec!["*".into()],
            ..Default::default()
        });
        assert!(sc.origin_allowed(Some("https://anything.example")));
        assert!(sc.origin_allowed(None));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.auth.mode, AuthMode::None);
        assert_eq!(fc.server.port, 8000);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nport = 9090\n\n[auth]\nmode = \"api\"\n\n[auth.api_keys]\nK1 = \"S1\"\n\n\
             [policy]\nsend_broadcasts = false\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 9090);
        assert_eq!(fc.auth.mode, AuthMode::Api);
        assert_eq!(fc.auth.api_keys.get("K1").map(String::as_str), Some("S1"));
        assert!(!fc.policy.send_broadcasts);
        assert!(fc.policy.send_user_messages);

        let gc = GatewayConfig::from_file(&fc, tmp.path()).unwrap();
        assert_eq!(gc.auth.mode, AuthMode::Api);
        assert_eq!(gc.sessions.user_dir, tmp.path().join("users"));
    }

    #[test]
    fn test_gatehouse_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested");
        let config = GatehouseConfig::new(Some(dir.clone())).unwrap();
        assert_eq!(config.data_dir, dir);
        assert!(dir.exists());
        assert_eq!(config.config_toml_path(), dir.join("config.toml"));
    }
}
