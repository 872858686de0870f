//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.
//!
//! The session splits the socket. A writer task drains the connection's
//! outbox and sends heartbeat pings. The control loop reads client frames,
//! applies control messages to the subscription table, and reaps pumps
//! that stopped on their own. On exit every pump is cancelled before the
//! outbox closes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use molt_stream::EventSource;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::protocol::ControlMessage;
use super::registry::ConnectionRegistry;
use super::subscriptions::SubscriptionManager;
use crate::metrics::{
    CONTROL_MESSAGES_IGNORED_TOTAL, ENVELOPES_SENT_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// How long teardown waits for the writer to flush queued envelopes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Ping cadence and liveness deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between server-initiated Ping frames.
    pub interval: Duration,
    /// Disconnect after this long without any frame from the client.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Server-wide dependencies handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Opens upstream chat streams.
    pub source: Arc<dyn EventSource>,
    /// Live connection table.
    pub registry: Arc<ConnectionRegistry>,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
}

/// Why the writer task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The outbox was closed and fully drained.
    OutboxClosed,
    /// Writing to the socket failed.
    SendFailed,
    /// The client went quiet for longer than the heartbeat timeout.
    HeartbeatTimeout,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent Close or the stream ended.
    ClientClosed,
    /// Reading from the socket failed.
    ReadError,
    /// The writer task stopped first.
    Writer(WriterExit),
    /// The server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::Writer(WriterExit::OutboxClosed) => "outbox_closed",
            Self::Writer(WriterExit::SendFailed) => "send_failed",
            Self::Writer(WriterExit::HeartbeatTimeout) => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a WebSocket session for a connected client.
#[instrument(skip_all, fields(client_id = %connection.id))]
pub async fn run_ws_session(ws: WebSocket, connection: Arc<ClientConnection>, ctx: SessionContext) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (mut manager, mut exits) =
        SubscriptionManager::new(Arc::clone(&connection), Arc::clone(&ctx.source));

    ctx.registry.add(Arc::clone(&connection)).await;
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let mut writer = tokio::spawn(run_writer(ws_tx, Arc::clone(&connection), ctx.heartbeat));

    let reason = loop {
        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break DisconnectReason::Shutdown,
            joined = &mut writer => {
                let exit = joined.unwrap_or_else(|error| {
                    warn!(%error, "writer task failed");
                    WriterExit::SendFailed
                });
                break DisconnectReason::Writer(exit);
            }
            Some(exit) = exits.recv() => {
                let _ = manager.on_pump_exit(&exit);
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(msg)) => {
                    connection.mark_alive();
                    if matches!(msg, Message::Close(_)) {
                        debug!("client sent close frame");
                        break DisconnectReason::ClientClosed;
                    }
                    if let Some(text) = inbound_text(&msg) {
                        apply_control(&mut manager, text);
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "websocket read failed");
                    break DisconnectReason::ReadError;
                }
                None => break DisconnectReason::ClientClosed,
            },
        }
    };

    let cancelled = manager.close();
    connection.outbox().close();
    if !matches!(reason, DisconnectReason::Writer(_))
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        debug!("writer did not drain in time");
        writer.abort();
    }
    let _ = ctx.registry.remove(&connection.id).await;

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    info!(
        reason = reason.as_str(),
        subscriptions = cancelled,
        dropped = connection.outbox().dropped_count(),
        "client disconnected"
    );
}

/// Extract control text from a client frame.
///
/// Text frames are used as-is; binary frames only when they are valid UTF-8.
fn inbound_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => Some(text),
            Err(_) => {
                counter!(CONTROL_MESSAGES_IGNORED_TOTAL).increment(1);
                debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                None
            }
        },
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Parse and apply one control message. Bad input is logged and dropped.
fn apply_control(manager: &mut SubscriptionManager, text: &str) {
    match ControlMessage::parse(text) {
        Ok(message) => {
            let kind = message.kind();
            let delta = manager.handle(message);
            debug!(
                kind,
                started = ?delta.started,
                cancelled = ?delta.cancelled,
                "control message applied"
            );
        }
        Err(error) => {
            counter!(CONTROL_MESSAGES_IGNORED_TOTAL).increment(1);
            debug!(%error, "ignoring control message");
        }
    }
}

/// Drain the outbox into `sink` and keep the client alive with pings.
///
/// Sends a Close frame once the outbox is closed and empty.
pub(crate) async fn run_writer<S>(
    mut sink: S,
    connection: Arc<ClientConnection>,
    heartbeat: HeartbeatConfig,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
{
    let outbox = Arc::clone(connection.outbox());
    let mut ping = tokio::time::interval(heartbeat.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = ping.tick() => {
                let quiet = connection.last_seen_elapsed();
                if quiet > heartbeat.timeout {
                    warn!(
                        quiet_ms = u64::try_from(quiet.as_millis()).unwrap_or(u64::MAX),
                        "client unresponsive, disconnecting"
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    return WriterExit::HeartbeatTimeout;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return WriterExit::SendFailed;
                }
            }
            next = outbox.next() => match next {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return WriterExit::SendFailed;
                    }
                    counter!(ENVELOPES_SENT_TOTAL).increment(1);
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return WriterExit::OutboxClosed;
                }
            },
        }
    }
}
