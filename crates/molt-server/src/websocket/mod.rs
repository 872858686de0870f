//! WebSocket connections, subscription management, and stream pumps.

pub mod connection;
pub mod outbox;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod session;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testing;
