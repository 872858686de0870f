//! Per-connection subscription table.
//!
//! Owned by exactly one connection's control loop, so control messages,
//! pump exits, and teardown are applied one at a time. Every operation
//! cancels a pump before its table entry is replaced or removed, keeping at
//! most one live pump per chat.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use molt_core::ChatId;
use molt_stream::EventSource;
use tokio::sync::mpsc;
use tracing::debug;

use super::connection::ClientConnection;
use super::protocol::ControlMessage;
use super::pump::{PumpContext, PumpExit, StreamPump};
use crate::metrics::CONTROL_MESSAGES_TOTAL;

/// Pumps started and cancelled by one operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionDelta {
    /// Chats whose pump was (re)started, in start order.
    pub started: Vec<ChatId>,
    /// Chats whose pump was cancelled, in cancel order.
    pub cancelled: Vec<ChatId>,
}

impl SubscriptionDelta {
    /// Whether the operation changed nothing.
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.cancelled.is_empty()
    }
}

/// The connection's chat → pump table.
pub struct SubscriptionManager {
    connection: Arc<ClientConnection>,
    ctx: PumpContext,
    pumps: HashMap<ChatId, StreamPump>,
    next_generation: u64,
}

impl SubscriptionManager {
    /// Create an empty table for `connection`.
    ///
    /// The receiver yields a [`PumpExit`] whenever a pump stops without being
    /// cancelled; feed each one back through [`on_pump_exit`](Self::on_pump_exit).
    pub fn new(
        connection: Arc<ClientConnection>,
        source: Arc<dyn EventSource>,
    ) -> (Self, mpsc::UnboundedReceiver<PumpExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let ctx = PumpContext {
            connection_id: connection.id.clone(),
            source,
            outbox: Arc::clone(connection.outbox()),
            exits,
        };
        let manager = Self {
            connection,
            ctx,
            pumps: HashMap::new(),
            next_generation: 0,
        };
        (manager, exit_rx)
    }

    /// Apply one control message.
    pub fn handle(&mut self, message: ControlMessage) -> SubscriptionDelta {
        counter!(CONTROL_MESSAGES_TOTAL, "type" => message.kind()).increment(1);
        match message {
            ControlMessage::Subscribe { chat_id, replay } => self.subscribe(chat_id, replay),
            ControlMessage::SubscribeMany { chat_ids, replay } => {
                self.subscribe_many(chat_ids, replay)
            }
            ControlMessage::Unsubscribe { chat_id } => {
                let mut delta = SubscriptionDelta::default();
                if self.unsubscribe(&chat_id) {
                    delta.cancelled.push(chat_id);
                }
                delta
            }
        }
    }

    /// Start a fresh pump for `chat_id`, cancelling any existing one first.
    ///
    /// Always restarts, so each explicit subscribe honors its replay flag.
    pub fn subscribe(&mut self, chat_id: ChatId, replay: bool) -> SubscriptionDelta {
        let mut delta = SubscriptionDelta::default();
        if self.cancel_and_remove(&chat_id) {
            delta.cancelled.push(chat_id.clone());
        }
        self.start(chat_id.clone(), replay);
        delta.started.push(chat_id);
        self.sync_count();
        delta
    }

    /// Make the subscribed set equal to `chat_ids`.
    ///
    /// Chats already subscribed and still wanted keep their running pump.
    pub fn subscribe_many(
        &mut self,
        chat_ids: impl IntoIterator<Item = ChatId>,
        replay: bool,
    ) -> SubscriptionDelta {
        let wanted: HashSet<ChatId> = chat_ids.into_iter().collect();
        let mut delta = SubscriptionDelta::default();

        let mut stale: Vec<ChatId> = self
            .pumps
            .keys()
            .filter(|id| !wanted.contains(*id))
            .cloned()
            .collect();
        stale.sort();
        for chat_id in stale {
            let _ = self.cancel_and_remove(&chat_id);
            delta.cancelled.push(chat_id);
        }

        let mut fresh: Vec<ChatId> = wanted
            .into_iter()
            .filter(|id| !self.pumps.contains_key(id))
            .collect();
        fresh.sort();
        for chat_id in fresh {
            self.start(chat_id.clone(), replay);
            delta.started.push(chat_id);
        }

        self.sync_count();
        delta
    }

    /// Stop following `chat_id`. Returns whether it was subscribed.
    pub fn unsubscribe(&mut self, chat_id: &ChatId) -> bool {
        let removed = self.cancel_and_remove(chat_id);
        self.sync_count();
        removed
    }

    /// Drop the entry of a pump that stopped on its own.
    ///
    /// Ignored when the entry already belongs to a newer pump.
    pub fn on_pump_exit(&mut self, exit: &PumpExit) -> bool {
        let current = self
            .pumps
            .get(&exit.chat_id)
            .is_some_and(|pump| pump.generation() == exit.generation);
        if !current {
            debug!(
                chat_id = %exit.chat_id,
                generation = exit.generation,
                "stale pump exit ignored"
            );
            return false;
        }
        let _ = self.pumps.remove(&exit.chat_id);
        self.sync_count();
        debug!(
            chat_id = %exit.chat_id,
            generation = exit.generation,
            end = ?exit.end,
            "subscription ended upstream"
        );
        true
    }

    /// Cancel every pump and empty the table. Returns how many were cancelled.
    pub fn close(mut self) -> usize {
        self.cancel_all()
    }

    /// Subscribed chats, sorted.
    pub fn chat_ids(&self) -> Vec<ChatId> {
        let mut ids: Vec<ChatId> = self.pumps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The pump serving `chat_id`, if any.
    pub fn pump(&self, chat_id: &ChatId) -> Option<&StreamPump> {
        self.pumps.get(chat_id)
    }

    /// Number of subscribed chats.
    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    /// Whether nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    fn start(&mut self, chat_id: ChatId, replay: bool) {
        self.next_generation += 1;
        let generation = self.next_generation;
        debug!(chat_id = %chat_id, generation, replay, "starting pump");
        let pump = StreamPump::spawn(&self.ctx, chat_id.clone(), replay, generation);
        let _ = self.pumps.insert(chat_id, pump);
    }

    fn cancel_and_remove(&mut self, chat_id: &ChatId) -> bool {
        let Some(pump) = self.pumps.get(chat_id) else {
            return false;
        };
        pump.cancel();
        let _ = self.pumps.remove(chat_id);
        true
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.pumps.len();
        for pump in self.pumps.values() {
            pump.cancel();
        }
        self.pumps.clear();
        self.sync_count();
        count
    }

    fn sync_count(&self) {
        self.connection.set_subscription_count(self.pumps.len());
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if !self.pumps.is_empty() {
            let _ = self.cancel_all();
        }
    }
}
