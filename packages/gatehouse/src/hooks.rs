//! Typed extension points.
//!
//! Extensions are compiled in and registered on a [`Hooks`] value before the
//! server starts. Every hook returns `anyhow::Result<()>`; an `Err` is logged
//! at the call site and never reaches the client or other hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gatehouse_auth::Identity;
use serde_json::Value;
use tracing::warn;

use crate::authenticator::AuthRequest;
use crate::connections::DeliveryTarget;
use crate::gateway::GatewayCore;
use crate::ws::ServerMessage;

/// Runs after every successful authentication, before the session is joined.
pub trait AuthPostHook: Send + Sync {
    fn after_authenticate(&self, identity: &Identity, request: &AuthRequest) -> anyhow::Result<()>;
}

/// An extension WebSocket command. Handlers are consulted before the
/// built-in commands, so registering a built-in name overrides it.
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, ctx: &CommandContext<'_>, arg: Value) -> anyhow::Result<()>;
}

/// Observes connections opening and closing.
pub trait ConnectionHook: Send + Sync {
    fn on_open(&self, _connection_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_close(&self, _connection_id: &str, _identity: Option<&Identity>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a [`CommandHandler`] gets to work with.
pub struct CommandContext<'a> {
    pub connection_id: &'a str,
    /// `None` until the connection has authenticated.
    pub identity: Option<&'a Identity>,
    pub core: &'a Arc<GatewayCore>,
}

impl CommandContext<'_> {
    /// Queue a message for the calling connection.
    pub fn reply(&self, msg: ServerMessage) -> bool {
        self.core.send(self.connection_id, msg)
    }

    pub fn deliver(&self, msg: &ServerMessage, target: &DeliveryTarget) -> usize {
        self.core.deliver(msg, target)
    }
}

/// A hook that returned an error, with enough context to find it in the logs.
#[derive(Debug, thiserror::Error)]
#[error("{point} hook `{name}` failed: {error:#}")]
pub struct HookError {
    pub point: &'static str,
    pub name: String,
    pub error: anyhow::Error,
}

impl HookError {
    pub fn new(point: &'static str, name: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            point,
            name: name.into(),
            error,
        }
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    auth_post: Vec<Arc<dyn AuthPostHook>>,
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    connection: Vec<Arc<dyn ConnectionHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        commands.sort_unstable();
        f.debug_struct("Hooks")
            .field("auth_post", &self.auth_post.len())
            .field("commands", &commands)
            .field("connection", &self.connection.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth_post_hook(mut self, hook: impl AuthPostHook + 'static) -> Self {
        self.auth_post.push(Arc::new(hook));
        self
    }

    /// Register a command handler. A later handler with the same name
    /// replaces the earlier one.
    pub fn with_command(mut self, handler: impl CommandHandler + 'static) -> Self {
        let name = handler.name().to_string();
        if self.commands.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(command = %name, "Command handler replaced");
        }
        self
    }

    pub fn with_connection_hook(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.connection.push(Arc::new(hook));
        self
    }

    pub fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).cloned()
    }

    /// Run every post-auth hook in registration order. Returns the number
    /// that failed.
    pub(crate) fn run_auth_post(&self, identity: &Identity, request: &AuthRequest) -> usize {
        let mut failed = 0;
        for (n, hook) in self.auth_post.iter().enumerate() {
            if let Err(e) = hook.after_authenticate(identity, request) {
                failed += 1;
                let err = HookError::new("auth", format!("#{n}"), e);
                warn!(upn = %identity.user_principal, "{err}");
            }
        }
        failed
    }

    pub(crate) fn run_open(&self, connection_id: &str) -> usize {
        let mut failed = 0;
        for (n, hook) in self.connection.iter().enumerate() {
            if let Err(e) = hook.on_open(connection_id) {
                failed += 1;
                let err = HookError::new("connection open", format!("#{n}"), e);
                warn!(conn_id = %connection_id, "{err}");
            }
        }
        failed
    }

    pub(crate) fn run_close(&self, connection_id: &str, identity: Option<&Identity>) -> usize {
        let mut failed = 0;
        for (n, hook) in self.connection.iter().enumerate() {
            if let Err(e) = hook.on_close(connection_id, identity) {
                failed += 1;
                let err = HookError::new("connection close", format!("#{n}"), e);
                warn!(conn_id = %connection_id, "{err}");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl AuthPostHook for Recorder {
        fn after_authenticate(&self, identity: &Identity, _: &AuthRequest) -> anyhow::Result<()> {
            self.0.lock().push(identity.user_principal.clone());
            Ok(())
        }
    }

    impl ConnectionHook for Recorder {
        fn on_close(&self, connection_id: &str, _: Option<&Identity>) -> anyhow::Result<()> {
            self.0.lock().push(format!("closed {connection_id}"));
            Ok(())
        }
    }

    struct Failing;

    impl AuthPostHook for Failing {
        fn after_authenticate(&self, _: &Identity, _: &AuthRequest) -> anyhow::Result<()> {
            anyhow::bail!("ldap lookup failed")
        }
    }

    struct Named(&'static str);

    impl CommandHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn handle(&self, _: &CommandContext<'_>, _: Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn auth_hooks_run_in_order_past_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = Hooks::new()
            .with_auth_post_hook(Failing)
            .with_auth_post_hook(Recorder(seen.clone()));

        let failed = hooks.run_auth_post(&Identity::new("alice", "s1"), &AuthRequest::default());
        assert_eq!(failed, 1);
        assert_eq!(*seen.lock(), vec!["alice".to_string()]);
    }

    #[test]
    fn connection_hooks_default_to_noop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = Hooks::new().with_connection_hook(Recorder(seen.clone()));
        assert_eq!(hooks.run_open("c1"), 0);
        assert_eq!(hooks.run_close("c1", None), 0);
        assert_eq!(*seen.lock(), vec!["closed c1".to_string()]);
    }

    #[test]
    fn commands_are_looked_up_by_name() {
        let hooks = Hooks::new().with_command(Named("terminal:new"));
        assert!(hooks.command("terminal:new").is_some());
        assert!(hooks.command("terminal:kill").is_none());
    }

    #[test]
    fn hook_error_names_the_hook() {
        let err = HookError::new("command", "terminal:new", anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "command hook `terminal:new` failed: boom");
    }
}
