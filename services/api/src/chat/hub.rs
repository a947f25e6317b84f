//! services/api/src/chat/hub.rs
//!
//! Registry of every live push connection, keyed by user.
//!
//! Each connection owns a bounded `mpsc` mailbox of status events. Delivery is
//! best-effort: a full or closed mailbox drops the event and nothing is replayed.

use dashmap::DashMap;
use research_assistant_core::domain::StatusEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one live push connection.
pub type ConnectionId = Uuid;

/// Default mailbox size for a single connection.
pub const CONNECTION_BUFFER: usize = 64;

pub struct ConnectionHub {
    connections: DashMap<Uuid, HashMap<ConnectionId, mpsc::Sender<StatusEvent>>>,
    buffer: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(CONNECTION_BUFFER)
    }
}

impl ConnectionHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Registers a new connection for `user_id` and returns its id and mailbox.
    pub fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let connection_id = Uuid::new_v4();
        self.connections
            .entry(user_id)
            .or_default()
            .insert(connection_id, tx);
        debug!(%user_id, %connection_id, "Connection registered");
        (connection_id, rx)
    }

    /// Removes a connection. Returns `true` if it was registered.
    pub fn unregister(&self, user_id: Uuid, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .get_mut(&user_id)
            .map(|mut conns| conns.remove(&connection_id).is_some())
            .unwrap_or(false);
        self.connections.remove_if(&user_id, |_, conns| conns.is_empty());
        if removed {
            debug!(%user_id, %connection_id, "Connection unregistered");
        }
        removed
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.connections.get(&user_id).map(|c| c.len()).unwrap_or(0)
    }

    /// Fans `event` out to every live connection of `user_id` except `except`.
    /// Returns the number of mailboxes that accepted it.
    pub fn notify(&self, user_id: Uuid, event: &StatusEvent, except: Option<ConnectionId>) -> usize {
        let Some(conns) = self.connections.get(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (connection_id, tx) in conns.iter() {
            if Some(*connection_id) == except {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%user_id, %connection_id, "Connection mailbox full, status event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%user_id, %connection_id, "Connection closed, status event dropped");
                }
            }
        }
        delivered
    }
}
