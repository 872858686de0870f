//! Client wire protocol.
//!
//! Inbound (client → gateway):
//!
//! ```json
//! {"type":"subscribe","chatId":"a","replay":true}
//! {"type":"subscribeMany","chatIds":["a","b"],"replay":false}
//! {"type":"unsubscribe","chatId":"a"}
//! ```
//!
//! Outbound (gateway → client):
//!
//! ```json
//! {"type":"event","chatId":"a","event":"output","payload":{"text":"hi"}}
//! ```

use molt_core::ChatId;
use molt_stream::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A subscription change requested by the client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// (Re)start one chat's stream.
    Subscribe {
        /// Chat to follow.
        chat_id: ChatId,
        /// Ask the backend to resend recent history first.
        #[serde(default = "default_replay")]
        replay: bool,
    },
    /// Make the subscription set equal to `chat_ids`.
    SubscribeMany {
        /// Full desired set; duplicates collapse.
        chat_ids: Vec<ChatId>,
        /// Replay flag for newly started streams.
        #[serde(default = "default_replay")]
        replay: bool,
    },
    /// Stop one chat's stream.
    Unsubscribe {
        /// Chat to drop.
        chat_id: ChatId,
    },
}

/// The backend replays history unless told otherwise.
fn default_replay() -> bool {
    true
}

/// Why an inbound message was not applied.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Not JSON, unknown `type`, or a missing/mistyped field.
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A chat id was empty or whitespace.
    #[error("control message contains an empty chat id")]
    EmptyChatId,
}

impl ControlMessage {
    /// Decode and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let message: Self = serde_json::from_str(text)?;
        let has_blank = match &message {
            Self::Subscribe { chat_id, .. } | Self::Unsubscribe { chat_id } => is_blank(chat_id),
            Self::SubscribeMany { chat_ids, .. } => chat_ids.iter().any(is_blank),
        };
        if has_blank {
            return Err(ControlError::EmptyChatId);
        }
        Ok(message)
    }

    /// Wire name of the message type, for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::SubscribeMany { .. } => "subscribeMany",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

fn is_blank(chat_id: &ChatId) -> bool {
    chat_id.trim().is_empty()
}

/// A message written to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage<'a> {
    /// One upstream frame, tagged with its chat.
    Event {
        /// Originating chat.
        chat_id: &'a ChatId,
        /// Frame event name.
        event: &'a str,
        /// Frame payload, passed through untouched.
        payload: &'a Value,
    },
}

impl<'a> ServerMessage<'a> {
    /// Envelope for a parsed frame.
    pub fn event(chat_id: &'a ChatId, frame: &'a Frame) -> Self {
        Self::Event {
            chat_id,
            event: &frame.event,
            payload: &frame.payload,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
