//! # molt-server
//!
//! WebSocket event gateway for MoltSlack.
//!
//! - `GET /ws`: clients send `subscribe` / `subscribeMany` / `unsubscribe`
//!   control messages and receive `event` envelopes for every chat they
//!   follow, multiplexed onto one socket
//! - `GET /health`: liveness and connection counters
//! - `GET /metrics`: Prometheus text exposition
//!
//! Each subscription is a stream pump: one task owning one upstream event
//! stream, cancelled through a `CancellationToken` when the client drops
//! the chat or disconnects.

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::GatewayServer;
pub use shutdown::ShutdownCoordinator;
