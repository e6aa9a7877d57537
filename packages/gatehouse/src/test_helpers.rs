use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{FileConfig, GatewayConfig};
use crate::connections::Outbound;
use crate::gateway::GatewayCore;
use crate::hooks::Hooks;

/// Build a fully-wired `GatewayCore` whose data directory is a fresh temp dir.
///
/// Returns `(core, TempDir)`; callers **must** hold the `TempDir` for the
/// lifetime of the test so the user, session and broadcast paths stay valid.
pub fn test_core() -> (Arc<GatewayCore>, tempfile::TempDir) {
    test_core_with(|_| {})
}

/// Like `test_core`, but lets the caller adjust the file config first.
pub fn test_core_with(
    configure: impl FnOnce(&mut FileConfig),
) -> (Arc<GatewayCore>, tempfile::TempDir) {
    test_core_with_hooks(configure, Hooks::new())
}

pub fn test_core_with_hooks(
    configure: impl FnOnce(&mut FileConfig),
    hooks: Hooks,
) -> (Arc<GatewayCore>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut fc = FileConfig::default();
    fc.auth.cookie_secret = Some("test-cookie-secret".into());
    configure(&mut fc);
    let config = GatewayConfig::from_file(&fc, tmp.path()).expect("config");
    let core = GatewayCore::new(config, hooks).expect("core");
    (core, tmp)
}

/// Everything queued for a connection so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}
