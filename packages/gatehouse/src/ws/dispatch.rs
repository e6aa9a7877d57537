//! Command dispatch for one connection.
//!
//! Each inbound frame is split into `(command, argument)` pairs which are
//! handled strictly in order. Extension handlers get the first look at a
//! command name; anything they don't claim is decoded into a built-in
//! [`Command`] at the boundary.

use std::sync::Arc;

use gatehouse_auth::{AuthResponse, Identity};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::authenticator::{AuthRequest, RequestContext};
use crate::connections::DeliveryTarget;
use crate::gateway::{EVENT_BROADCAST, EVENT_SEND_USER_MESSAGE, GatewayCore};
use crate::hooks::{CommandContext, HookError};

use super::protocol::{Command, SendUserMessageArgs, ServerMessage, parse_frame};

pub const UNAUTHENTICATED_NOTICE: &str = "Only valid users please.  Thanks!";
pub const NO_MESSAGE_NOTICE: &str = "Error: No message to send.";
pub const MISSING_UPN_NOTICE: &str = "Error: Missing UPN.";
pub const USER_MESSAGES_DISABLED_NOTICE: &str =
    "Error: Sending messages to other users is disabled on this server.";
pub const BROADCASTS_DISABLED_NOTICE: &str = "Error: Broadcasts are disabled on this server.";

/// Per-connection context shared between the transport layer and the dispatcher.
pub(crate) struct ConnectionContext {
    pub connection_id: String,
    /// Facts about the upgrade request, captured once.
    pub request: RequestContext,
    pub core: Arc<GatewayCore>,
}

impl ConnectionContext {
    fn reply(&self, msg: ServerMessage) {
        self.core.send(&self.connection_id, msg);
    }

    fn reply_and_close(&self, msg: ServerMessage) -> DispatchResult {
        self.reply(msg);
        self.core.connections().close(&self.connection_id);
        DispatchResult::Close
    }
}

/// What the reader loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchResult {
    Continue,
    /// The connection has been told to close; stop reading.
    Close,
}

/// Handle one text frame.
pub(crate) fn dispatch_frame(ctx: &ConnectionContext, text: &str) -> DispatchResult {
    ctx.core.metrics().message_received();
    let commands = match parse_frame(text) {
        Ok(commands) => commands,
        Err(e) => {
            ctx.core.metrics().message_dropped();
            debug!(conn_id = %ctx.connection_id, error = %e, "Rejected frame");
            ctx.reply(e.notice());
            return DispatchResult::Continue;
        }
    };
    for (name, arg) in commands {
        if dispatch_command(ctx, &name, arg) == DispatchResult::Close {
            return DispatchResult::Close;
        }
    }
    DispatchResult::Continue
}

/// Handle a single command from a frame.
pub(crate) fn dispatch_command(ctx: &ConnectionContext, name: &str, arg: Value) -> DispatchResult {
    let identity = ctx.core.connections().identity(&ctx.connection_id);

    if let Some(handler) = ctx.core.hooks().command(name) {
        let cmd_ctx = CommandContext {
            connection_id: &ctx.connection_id,
            identity: identity.as_ref(),
            core: &ctx.core,
        };
        if let Err(e) = handler.handle(&cmd_ctx, arg) {
            ctx.core.metrics().hook_failed(1);
            let err = HookError::new("command", name, e);
            warn!(conn_id = %ctx.connection_id, "{err}");
        }
        return DispatchResult::Continue;
    }

    if Command::requires_authentication(name) && identity.is_none() {
        warn!(
            conn_id = %ctx.connection_id,
            ip = %ctx.request.ip_address,
            command = %name,
            "Unauthenticated use of an authenticated-only command"
        );
        return ctx.reply_and_close(ServerMessage::notice(UNAUTHENTICATED_NOTICE));
    }

    let command = match Command::decode(name, arg) {
        Ok(command) => command,
        Err(e) => {
            ctx.core.metrics().hook_failed(1);
            warn!(conn_id = %ctx.connection_id, error = %e, "Failed to decode command");
            return DispatchResult::Continue;
        }
    };

    match (command, identity) {
        (Command::Ping(value), _) => {
            ctx.reply(ServerMessage::Pong(value));
            DispatchResult::Continue
        }
        (Command::Authenticate(request), _) => authenticate(ctx, &request),
        (Command::SendUserMessage(args), Some(sender)) => {
            send_user_message(ctx, &sender, args);
            DispatchResult::Continue
        }
        (Command::Broadcast(text), Some(sender)) => {
            broadcast(ctx, &sender, &text);
            DispatchResult::Continue
        }
        (Command::Unknown(name), _) => {
            debug!(conn_id = %ctx.connection_id, command = %name, "Ignoring unknown command");
            DispatchResult::Continue
        }
        // Authenticated-only commands without an identity were refused above.
        (Command::SendUserMessage(_) | Command::Broadcast(_), None) => DispatchResult::Continue,
    }
}

fn authenticate(ctx: &ConnectionContext, request: &AuthRequest) -> DispatchResult {
    let err = match ctx
        .core
        .authenticate_connection(&ctx.connection_id, request, &ctx.request)
    {
        Ok(_) => return DispatchResult::Continue,
        Err(e) => e,
    };
    match err.response() {
        AuthResponse::Reauthenticate => {
            ctx.reply(ServerMessage::reauthenticate());
            DispatchResult::Continue
        }
        AuthResponse::Notice { text } => {
            ctx.reply(ServerMessage::notice(text));
            DispatchResult::Continue
        }
        AuthResponse::Close { text } => ctx.reply_and_close(ServerMessage::notice(text)),
    }
}

fn send_user_message(ctx: &ConnectionContext, sender: &Identity, args: SendUserMessageArgs) {
    if !ctx.core.config().policy.send_user_messages {
        ctx.reply(ServerMessage::notice(USER_MESSAGES_DISABLED_NOTICE));
        return;
    }
    let Some(message) = args.message.filter(|m| !m.is_empty()) else {
        ctx.reply(ServerMessage::notice(NO_MESSAGE_NOTICE));
        return;
    };
    let Some(upn) = args.upn.filter(|u| !u.is_empty()) else {
        ctx.reply(ServerMessage::notice(MISSING_UPN_NOTICE));
        return;
    };

    let delivered = ctx.core.deliver(
        &ServerMessage::notice(message.as_str()),
        &DeliveryTarget::Principal(upn.clone()),
    );
    info!(from = %sender.user_principal, to = %upn, delivered, "User message sent");

    let payload = json!({ "from": &sender.user_principal, "upn": upn, "message": message });
    let outcome = ctx.core.events().trigger(&[EVENT_SEND_USER_MESSAGE], &payload);
    ctx.core.metrics().hook_failed(outcome.failed);
}

fn broadcast(ctx: &ConnectionContext, sender: &Identity, text: &str) {
    if !ctx.core.config().policy.send_broadcasts {
        ctx.reply(ServerMessage::notice(BROADCASTS_DISABLED_NOTICE));
        return;
    }
    if text.is_empty() {
        ctx.reply(ServerMessage::notice(NO_MESSAGE_NOTICE));
        return;
    }

    let escaped = escape_html(text);
    info!(from = %sender.user_principal, message = %escaped, "Broadcast");
    ctx.core.broadcast_notice(&escaped);

    let payload = json!({ "from": &sender.user_principal, "message": escaped, "source": "websocket" });
    let outcome = ctx.core.events().trigger(&[EVENT_BROADCAST], &payload);
    ctx.core.metrics().hook_failed(outcome.failed);
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
