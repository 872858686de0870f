//! Per-connection outbound queue.
//!
//! Pumps push serialized envelopes without ever waiting; the connection's
//! writer task drains them in FIFO order. When the queue is full the oldest
//! entry is evicted, so a slow client loses stale events instead of stalling
//! every upstream read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of [`Outbox::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with room to spare.
    Queued,
    /// Queued after evicting the oldest entry.
    DroppedOldest,
    /// The outbox is closed; nothing was queued.
    Closed,
}

#[derive(Debug)]
struct OutboxState {
    queue: VecDeque<String>,
    closed: bool,
}

/// Bounded drop-oldest queue with a single async consumer.
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    ready: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            ready: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message. Never blocks.
    pub fn push(&self, message: String) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.queue.len() >= self.capacity {
                let _ = state.queue.pop_front();
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.queue.push_back(message);
            outcome
        };
        self.ready.notify_one();
        outcome
    }

    /// Wait for the next message.
    ///
    /// Messages queued before [`close`](Self::close) are still delivered;
    /// `None` is returned once the outbox is closed and empty. Cancel-safe.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.queue.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stop accepting messages and wake the consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
