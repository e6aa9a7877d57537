//! WebSocket Protocol Types
//!
//! Inbound frames are a single JSON object whose keys are command names and
//! whose values are that command's argument:
//!
//! ```text
//! {"authenticate": {"auth": {...}, "location": "tab1"}, "ping": 1700000000}
//! ```
//!
//! Outbound frames are a JSON object with one well-known key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authenticator::AuthRequest;

// =============================================================================
// Server → client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// `{"reauthenticate": true}`
    Reauthenticate(bool),
    /// `{"notice": "..."}`
    Notice(String),
    /// `{"set_username": "<upn>"}`
    SetUsername(String),
    /// `{"pong": <whatever the client sent>}`
    Pong(Value),
    /// `{"session_token": "<signed value>"}` for the client to keep and
    /// present as `auth` on its next connection.
    SessionToken(String),
    /// Extension-defined payloads, sent as-is.
    #[serde(untagged)]
    Raw(Value),
}

impl ServerMessage {
    pub fn reauthenticate() -> Self {
        Self::Reauthenticate(true)
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::Notice(text.into())
    }
}

// =============================================================================
// Client → server
// =============================================================================

pub const NOT_JSON_NOTICE: &str = "Error: We only accept JSON here.";
pub const NOT_OBJECT_NOTICE: &str = "Message must be a JSON dict.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON")]
    NotJson,
    #[error("frame is not a JSON object")]
    NotObject,
}

impl FrameError {
    /// The notice sent back to the offending connection.
    pub fn notice(&self) -> ServerMessage {
        match self {
            Self::NotJson => ServerMessage::notice(NOT_JSON_NOTICE),
            Self::NotObject => ServerMessage::notice(NOT_OBJECT_NOTICE),
        }
    }
}

/// Split one text frame into `(command, argument)` pairs, in the order the
/// client wrote them.
pub fn parse_frame(text: &str) -> Result<Vec<(String, Value)>, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|_| FrameError::NotJson)?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(FrameError::NotObject),
    }
}

/// Arguments for `go:send_user_message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SendUserMessageArgs {
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A built-in command with its argument decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping(Value),
    Authenticate(AuthRequest),
    SendUserMessage(SendUserMessageArgs),
    Broadcast(String),
    Unknown(String),
}

pub const CMD_PING: &str = "ping";
pub const CMD_AUTHENTICATE: &str = "authenticate";
pub const CMD_SEND_USER_MESSAGE: &str = "go:send_user_message";
pub const CMD_BROADCAST: &str = "go:broadcast";

#[derive(Debug, thiserror::Error)]
#[error("invalid argument for {command}: {source}")]
pub struct CommandDecodeError {
    pub command: String,
    #[source]
    pub source: serde_json::Error,
}

/// `null`, `""`, `{}` and `[]` all mean "no argument".
fn is_empty_arg(arg: &Value) -> bool {
    match arg {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn decode_arg<T: serde::de::DeserializeOwned + Default>(
    command: &str,
    arg: Value,
) -> Result<T, CommandDecodeError> {
    if is_empty_arg(&arg) {
        return Ok(T::default());
    }
    serde_json::from_value(arg).map_err(|source| CommandDecodeError {
        command: command.to_string(),
        source,
    })
}

impl Command {
    pub fn decode(name: &str, arg: Value) -> Result<Self, CommandDecodeError> {
        Ok(match name {
            CMD_PING if is_empty_arg(&arg) => Self::Ping(Value::Null),
            CMD_PING => Self::Ping(arg),
            CMD_AUTHENTICATE => Self::Authenticate(decode_arg(name, arg)?),
            CMD_SEND_USER_MESSAGE => Self::SendUserMessage(decode_arg(name, arg)?),
            CMD_BROADCAST => Self::Broadcast(decode_arg(name, arg)?),
            other => Self::Unknown(other.to_string()),
        })
    }

    /// Whether the named built-in needs an authenticated connection. Checked
    /// on the name so an unauthenticated caller is refused before its
    /// argument is looked at.
    pub fn requires_authentication(name: &str) -> bool {
        matches!(name, CMD_SEND_USER_MESSAGE | CMD_BROADCAST)
    }
}
