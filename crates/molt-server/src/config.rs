//! Server configuration.

use std::time::Duration;

use molt_settings::ServerSettings;
use serde::{Deserialize, Serialize};

use crate::websocket::session::HeartbeatConfig;

/// Configuration for the gateway server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close the connection after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Envelopes buffered per connection before the oldest are dropped.
    pub outbound_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Seconds to wait for tasks on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            outbound_queue_capacity: 1024,
            max_message_size: 1024 * 1024, // 1 MB
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Ping cadence and pong deadline for each connection.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
        }
    }

    /// Graceful shutdown deadline.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
            outbound_queue_capacity: settings.outbound_queue_capacity,
            max_message_size: settings.max_message_size,
            shutdown_timeout_secs: settings.shutdown_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_auto_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn default_limits() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.outbound_queue_capacity, 1024);
        assert_eq!(cfg.max_message_size, 1024 * 1024);
    }

    #[test]
    fn heartbeat_durations() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            ..ServerConfig::default()
        };
        let hb = cfg.heartbeat();
        assert_eq!(hb.interval, Duration::from_secs(15));
        assert_eq!(hb.timeout, Duration::from_secs(45));
    }

    #[test]
    fn zero_heartbeat_interval_clamped() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat().interval, Duration::from_secs(1));
    }

    #[test]
    fn from_settings_copies_every_field() {
        let settings = ServerSettings {
            host: "0.0.0.0".into(),
            port: 9000,
            max_connections: 3,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 20,
            outbound_queue_capacity: 8,
            max_message_size: 4096,
            shutdown_timeout_secs: 2,
        };
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.heartbeat_interval_secs, 5);
        assert_eq!(cfg.heartbeat_timeout_secs, 20);
        assert_eq!(cfg.outbound_queue_capacity, 8);
        assert_eq!(cfg.max_message_size, 4096);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.outbound_queue_capacity, cfg.outbound_queue_capacity);
    }
}
