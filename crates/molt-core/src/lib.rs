//! # molt-core
//!
//! Foundation types for the MoltSlack event gateway.
//!
//! - [`ids`]: branded identifier newtypes ([`ChatId`], [`ConnectionId`])
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ChatId, ConnectionId};
pub use logging::{LogFormat, init_subscriber};
