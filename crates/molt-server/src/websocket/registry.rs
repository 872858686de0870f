//! Server-wide table of live connections.
//!
//! Used for admission control, `/health` counters, and nothing else: the
//! gateway never fans out across connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use molt_core::ConnectionId;
use tokio::sync::RwLock;
use tracing::debug;

use super::connection::ClientConnection;

/// Tracks connected clients and reserved connection slots.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    reserved: AtomicUsize,
}

/// A held connection slot, released on drop.
///
/// Reserved before the WebSocket upgrade so a failed handshake cannot leak
/// capacity.
#[derive(Debug)]
pub struct ConnectionSlot {
    registry: Arc<ConnectionRegistry>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.registry.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot unless `max` are already held.
    pub fn try_reserve(self: &Arc<Self>, max: usize) -> Option<ConnectionSlot> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < max).then_some(held + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                registry: Arc::clone(self),
            })
    }

    /// Slots currently held, including connections still upgrading.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        debug!(client_id = %connection.id, total = conns.len() + 1, "connection registered");
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().await.remove(connection_id)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Active subscriptions summed over all connections.
    pub async fn subscription_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.subscription_count())
            .sum()
    }
}
