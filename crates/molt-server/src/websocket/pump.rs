//! Stream pumps: one task per `(connection, chat)` subscription.
//!
//! A pump opens the chat's upstream stream, feeds every chunk to its own
//! [`FrameParser`], and queues one envelope per frame on the connection's
//! [`Outbox`]. It stops when its token is cancelled, when the upstream ends
//! or fails, or when the outbox closes.
//!
//! Emission and cancellation share a gate: [`StreamPump::cancel`] takes the
//! gate before cancelling the token, and each emit checks the token while
//! holding it. Once `cancel` returns, the pump emits nothing more, even for
//! chunks it had already read.

use std::sync::Arc;

use futures::StreamExt;
use metrics::{counter, gauge};
use molt_core::{ChatId, ConnectionId};
use molt_stream::{EventSource, Frame, FrameParser};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::outbox::{Outbox, PushOutcome};
use super::protocol::ServerMessage;
use crate::metrics::{
    ENVELOPES_DROPPED_TOTAL, ENVELOPES_EMITTED_TOTAL, PUMPS_ACTIVE, PUMPS_CANCELLED_TOTAL,
    PUMPS_STARTED_TOTAL, UPSTREAM_ERRORS_TOTAL,
};

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The owner cancelled it.
    Cancelled,
    /// The upstream closed the stream.
    Completed,
    /// Opening or reading the upstream failed.
    Failed(String),
    /// The connection's outbox was closed.
    OutboxClosed,
}

/// Notification sent to the owning connection when a pump stops on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpExit {
    /// Chat the pump served.
    pub chat_id: ChatId,
    /// Generation of the pump, to tell it apart from a replacement.
    pub generation: u64,
    /// Why it stopped. Never [`PumpEnd::Cancelled`].
    pub end: PumpEnd,
}

/// What every pump of one connection shares.
#[derive(Clone)]
pub struct PumpContext {
    /// Owning connection, for log context.
    pub connection_id: ConnectionId,
    /// Upstream stream opener.
    pub source: Arc<dyn EventSource>,
    /// Destination for envelopes.
    pub outbox: Arc<Outbox>,
    /// Exit notifications back to the control loop.
    pub exits: mpsc::UnboundedSender<PumpExit>,
}

/// Handle to a running pump. Owned by the subscription table.
#[derive(Debug)]
pub struct StreamPump {
    chat_id: ChatId,
    replay: bool,
    generation: u64,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

impl StreamPump {
    /// Spawn a pump for `chat_id`.
    pub fn spawn(ctx: &PumpContext, chat_id: ChatId, replay: bool, generation: u64) -> Self {
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let span = info_span!(
            "pump",
            client_id = %ctx.connection_id,
            chat_id = %chat_id,
            generation,
            replay
        );

        let worker = PumpWorker {
            source: Arc::clone(&ctx.source),
            outbox: Arc::clone(&ctx.outbox),
            chat_id: chat_id.clone(),
            replay,
            token: token.clone(),
            gate: Arc::clone(&gate),
        };
        let exits = ctx.exits.clone();
        let task = tokio::spawn(
            async move {
                counter!(PUMPS_STARTED_TOTAL).increment(1);
                gauge!(PUMPS_ACTIVE).increment(1.0);
                let end = worker.run().await;
                gauge!(PUMPS_ACTIVE).decrement(1.0);

                if end == PumpEnd::Cancelled {
                    counter!(PUMPS_CANCELLED_TOTAL).increment(1);
                    debug!("pump cancelled");
                    return;
                }
                debug!(?end, "pump stopped");
                let _ = exits.send(PumpExit {
                    chat_id: worker.chat_id,
                    generation,
                    end,
                });
            }
            .instrument(span),
        );

        Self {
            chat_id,
            replay,
            generation,
            token,
            gate,
            task,
        }
    }

    /// Stop the pump. Idempotent; no envelope is queued after this returns.
    pub fn cancel(&self) {
        let _gate = self.gate.lock();
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the pump task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Chat this pump serves.
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// Replay flag the upstream was opened with.
    pub fn replay(&self) -> bool {
        self.replay
    }

    /// Generation number within the owning connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct PumpWorker {
    source: Arc<dyn EventSource>,
    outbox: Arc<Outbox>,
    chat_id: ChatId,
    replay: bool,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl PumpWorker {
    async fn run(&self) -> PumpEnd {
        let opened = tokio::select! {
            biased;
            () = self.token.cancelled() => return PumpEnd::Cancelled,
            opened = self.source.open(&self.chat_id, self.replay) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                counter!(UPSTREAM_ERRORS_TOTAL, "kind" => error.kind()).increment(1);
                if error.is_not_found() {
                    info!(%error, "chat not found upstream");
                } else {
                    warn!(%error, "failed to open upstream stream");
                }
                return PumpEnd::Failed(error.to_string());
            }
        };
        debug!("upstream stream open");

        let mut parser = FrameParser::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return PumpEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for frame in parser.push_bytes(&chunk) {
                        if let Some(end) = self.emit(&frame) {
                            return end;
                        }
                    }
                }
                Some(Err(error)) => {
                    counter!(UPSTREAM_ERRORS_TOTAL, "kind" => error.kind()).increment(1);
                    warn!(%error, "upstream stream failed");
                    return PumpEnd::Failed(error.to_string());
                }
                None => {
                    debug!(buffered = parser.buffered_len(), "upstream stream ended");
                    return PumpEnd::Completed;
                }
            }
        }
    }

    /// Queue one envelope. Returns `Some` when the pump must stop.
    fn emit(&self, frame: &Frame) -> Option<PumpEnd> {
        let json = match ServerMessage::event(&self.chat_id, frame).to_json() {
            Ok(json) => json,
            Err(error) => {
                warn!(%error, event = %frame.event, "failed to serialize envelope");
                return None;
            }
        };

        let _gate = self.gate.lock();
        if self.token.is_cancelled() {
            return Some(PumpEnd::Cancelled);
        }
        match self.outbox.push(json) {
            PushOutcome::Queued => {
                counter!(ENVELOPES_EMITTED_TOTAL).increment(1);
                None
            }
            PushOutcome::DroppedOldest => {
                counter!(ENVELOPES_EMITTED_TOTAL).increment(1);
                counter!(ENVELOPES_DROPPED_TOTAL).increment(1);
                None
            }
            PushOutcome::Closed => Some(PumpEnd::OutboxClosed),
        }
    }
}
