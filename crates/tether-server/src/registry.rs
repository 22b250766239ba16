//! Live accepted connections.

use std::collections::HashMap;

use tether_core::ConnectionId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::Connection;

/// Accepted connections indexed by id, so shutdown can close them all.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub async fn add(&self, connection: Connection) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id(), connection);
    }

    /// Remove a connection by id.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Close every registered connection. Returns how many were still open.
    pub async fn close_all(&self) -> usize {
        let conns = self.connections.read().await;
        let closed = conns.values().filter(|c| c.close(None)).count();
        debug!(total = conns.len(), closed, "closed registered connections");
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
