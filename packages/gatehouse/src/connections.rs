//! Live connection set and best-effort multicast delivery.

use std::collections::HashMap;

use gatehouse_auth::{AUTHENTICATED, Identity};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ws::ServerMessage;

/// What a connection's writer task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Flush what is queued, then close the socket.
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

pub struct ConnectionHandle {
    pub id: String,
    /// `None` until the connection authenticates.
    pub identity: Option<Identity>,
    tx: OutboundSender,
}

/// Who a [`ConnectionRegistry::deliver`] call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Every connection of this principal. [`AUTHENTICATED`] means every
    /// authenticated connection.
    Principal(String),
    /// Every connection bound to this session id.
    Session(String),
}

impl DeliveryTarget {
    pub fn all_authenticated() -> Self {
        Self::Principal(AUTHENTICATED.to_string())
    }

    fn matches(&self, identity: &Identity) -> bool {
        match self {
            Self::Session(session_id) => identity.session_id == *session_id,
            Self::Principal(upn) => upn == AUTHENTICATED || identity.user_principal == *upn,
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, tx: OutboundSender) {
        self.connections.write().insert(
            id.to_string(),
            ConnectionHandle {
                id: id.to_string(),
                identity: None,
                tx,
            },
        );
    }

    pub fn remove(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.write().remove(id)
    }

    /// Attach `identity` to a connection, returning whatever it replaced.
    pub fn bind_identity(&self, id: &str, identity: Identity) -> Option<Identity> {
        let mut connections = self.connections.write();
        let handle = connections.get_mut(id)?;
        handle.identity.replace(identity)
    }

    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.connections
            .read()
            .get(id)
            .and_then(|h| h.identity.clone())
    }

    /// Queue a message for one connection.
    pub fn send(&self, id: &str, msg: ServerMessage) -> bool {
        self.connections
            .read()
            .get(id)
            .is_some_and(|h| h.tx.send(Outbound::Message(msg)).is_ok())
    }

    /// Ask a connection's writer to close after draining its queue.
    pub fn close(&self, id: &str) -> bool {
        self.connections
            .read()
            .get(id)
            .is_some_and(|h| h.tx.send(Outbound::Close).is_ok())
    }

    /// Fire-and-forget multicast. Connections without an identity are
    /// skipped. Returns how many connections the message was queued for.
    pub fn deliver(&self, msg: &ServerMessage, target: &DeliveryTarget) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;
        for handle in connections.values() {
            let Some(identity) = &handle.identity else {
                continue;
            };
            if !target.matches(identity) {
                continue;
            }
            if handle.tx.send(Outbound::Message(msg.clone())).is_ok() {
                delivered += 1;
            } else {
                debug!(conn_id = %handle.id, "Delivery to closed connection skipped");
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|h| h.identity.is_some())
            .count()
    }
}
