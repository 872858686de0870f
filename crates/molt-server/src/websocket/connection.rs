//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use molt_core::ConnectionId;
use parking_lot::Mutex;
use tokio::time::Instant as TokioInstant;

use super::outbox::Outbox;

/// Shared view of one connected client.
///
/// The subscription table itself lives in the session's control loop; this
/// struct only carries what other tasks need to see.
#[derive(Debug)]
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// When this connection was established.
    pub connected_at: Instant,
    outbox: Arc<Outbox>,
    last_seen: Mutex<TokioInstant>,
    subscriptions: AtomicUsize,
}

impl ClientConnection {
    /// Create a connection with an outbox of `outbox_capacity` envelopes.
    pub fn new(id: ConnectionId, outbox_capacity: usize) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            outbox: Arc::new(Outbox::new(outbox_capacity)),
            last_seen: Mutex::new(TokioInstant::now()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Outbound queue drained by the writer task.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Record inbound activity (pong or any frame).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = TokioInstant::now();
    }

    /// Time since the client was last heard from (tokio clock).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Number of chats this connection currently follows.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    pub(crate) fn set_subscription_count(&self, count: usize) {
        self.subscriptions.store(count, Ordering::Relaxed);
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
