//! Per-principal session persistence: `<user_dir>/<upn>/session`.
//!
//! Repeated API authentications for one principal reuse the stored session
//! id, across reconnects and across server restarts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use gatehouse_auth::generate_session_id;
use serde::{Deserialize, Serialize};
use tracing::info;

const SESSION_FILE: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub upn: String,
    pub session: String,
}

/// A principal is used verbatim as a directory name, so anything that could
/// escape `user_dir` is refused.
pub fn validate_principal(upn: &str) -> Result<()> {
    if upn.is_empty() {
        bail!("principal is empty");
    }
    if upn == "." || upn == ".." || upn.contains(['/', '\\', '\0']) {
        bail!("principal {upn:?} is not a valid directory name");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UserStore {
    user_dir: PathBuf,
}

impl UserStore {
    pub fn new(user_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_dir: user_dir.into(),
        }
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn principal_dir(&self, upn: &str) -> PathBuf {
        self.user_dir.join(upn)
    }

    /// Load the principal's session, or mint and persist a new one.
    pub fn load_or_create(&self, upn: &str) -> Result<StoredSession> {
        validate_principal(upn)?;
        let dir = self.principal_dir(upn);
        let path = dir.join(SESSION_FILE);

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read session file: {}", path.display()))?;
            let stored: StoredSession = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session file: {}", path.display()))?;
            return Ok(stored);
        }

        create_private_dir(&dir)?;
        let stored = StoredSession {
            upn: upn.to_string(),
            session: generate_session_id(),
        };
        let json = serde_json::to_string(&stored)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write session file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }

        info!(upn = %upn, "Created session file for new principal");
        Ok(stored)
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create user directory: {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o770))
            .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
    }

    Ok(())
}
