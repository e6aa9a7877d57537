//! WebSocket Handler
//!
//! One connection per browser tab (or embedding client):
//! - Inbound frames carry one or more commands, dispatched in order
//! - Outbound messages are queued per connection and written by one task

mod dispatch;
mod handler;
mod protocol;

// Re-export the main types and functions
pub use dispatch::{
    BROADCASTS_DISABLED_NOTICE, MISSING_UPN_NOTICE, NO_MESSAGE_NOTICE, UNAUTHENTICATED_NOTICE,
    USER_MESSAGES_DISABLED_NOTICE, escape_html,
};
pub use handler::handle_connection;
pub use protocol::{
    CMD_AUTHENTICATE, CMD_BROADCAST, CMD_PING, CMD_SEND_USER_MESSAGE, Command,
    CommandDecodeError, FrameError, NOT_JSON_NOTICE, NOT_OBJECT_NOTICE, SendUserMessageArgs,
    ServerMessage, parse_frame,
};
