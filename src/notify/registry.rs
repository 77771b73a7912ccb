//! Instance-local registry of live user connections

use crate::types::{MatchEvent, UserEvent, UserId};
use crate::utils::generate_connection_id;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

struct Connection {
    id: Uuid,
    sender: mpsc::UnboundedSender<MatchEvent>,
}

/// Connections pinned to this instance, keyed by user.
///
/// A user holds at most one connection per instance; registering again
/// replaces (and thereby closes) the previous one.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id` and return its id and event receiver
    pub fn register(&self, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<MatchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = generate_connection_id();

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections
            .insert(user_id.to_string(), Connection { id, sender })
            .is_some()
        {
            debug!("Replaced existing connection for user '{}'", user_id);
        }
        (id, receiver)
    }

    /// Remove the connection if it is still the current one for the user
    pub fn unregister(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        match connections.get(user_id) {
            Some(connection) if connection.id == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Forward an event if this instance holds the user's connection.
    /// Returns whether the event was delivered locally.
    pub fn deliver(&self, event: &UserEvent) -> bool {
        let delivered = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            match connections.get(&event.user_id) {
                Some(connection) => connection.sender.send(event.event.clone()).is_ok(),
                None => return false,
            }
        };

        if !delivered {
            // Receiver dropped without unregistering
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            if connections
                .get(&event.user_id)
                .map(|connection| connection.sender.is_closed())
                .unwrap_or(false)
            {
                connections.remove(&event.user_id);
            }
        }
        delivered
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections
            .read()
            .map(|connections| connections.contains_key(user_id))
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }
}
