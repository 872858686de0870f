//! Opening per-chat event streams on the session backend.
//!
//! [`EventSource`] is the seam between a pump and the backend. The gateway
//! uses [`HttpEventSource`]; tests substitute in-process sources.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use molt_core::ChatId;
use reqwest::Url;
use reqwest::header::ACCEPT;
use thiserror::Error;
use tracing::debug;

/// Longest error body kept from a failed upstream response.
const MAX_ERROR_BODY: usize = 512;

/// Raw body chunks of one upstream stream.
///
/// Dropping the stream closes the underlying request.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Errors from opening or reading an upstream stream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The configured base URL cannot carry the events path.
    #[error("invalid upstream base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Transport failure while connecting or reading the body.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The backend answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

impl UpstreamError {
    /// Whether the backend reported the chat as unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidBaseUrl { .. } => "invalid_url",
            Self::Request(_) => "request",
            Self::Status { .. } => "status",
        }
    }
}

/// Opens one event stream per `(chat, replay)` request.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Start streaming events for `chat_id`.
    ///
    /// With `replay` set, the backend resends its recent history before
    /// live events.
    async fn open(&self, chat_id: &ChatId, replay: bool) -> Result<ByteStream, UpstreamError>;
}

/// [`EventSource`] backed by `GET {base}/api/chats/{id}/events`.
#[derive(Clone, Debug)]
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpEventSource {
    /// Build a source with its own client.
    ///
    /// Only the connect phase is time-limited; the streams themselves are
    /// unbounded.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Self::with_client(client, base_url)
    }

    /// Build a source around an existing client.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, UpstreamError> {
        let parsed = Url::parse(base_url.trim()).map_err(|e| UpstreamError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(UpstreamError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "expected an http(s) URL".into(),
            });
        }
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    /// The configured backend base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Events URL for one chat. The id is encoded as a single path segment.
    pub fn events_url(&self, chat_id: &ChatId, replay: bool) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| UpstreamError::InvalidBaseUrl {
                    url: self.base_url.to_string(),
                    reason: "cannot be a base".into(),
                })?;
            let _ = segments
                .pop_if_empty()
                .extend(["api", "chats", chat_id.as_str(), "events"]);
        }
        url.set_query(None);
        let _ = url
            .query_pairs_mut()
            .append_pair("replay", if replay { "1" } else { "0" });
        Ok(url)
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, chat_id: &ChatId, replay: bool) -> Result<ByteStream, UpstreamError> {
        let url = self.events_url(chat_id, replay)?;
        debug!(chat_id = %chat_id, %url, "opening upstream event stream");

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        Ok(Box::pin(
            response.bytes_stream().map(|chunk| chunk.map_err(UpstreamError::from)),
        ))
    }
}
