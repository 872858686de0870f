//! In-process [`EventSource`] for pump and subscription tests.
//!
//! Every `open` hands the test a [`Feed`] to push chunks through. A feed
//! reports closed once the pump has dropped its stream.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use molt_core::ChatId;
use molt_stream::{ByteStream, EventSource, UpstreamError};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// `None` ends the stream.
type FeedItem = Option<Result<Bytes, UpstreamError>>;

/// Test-side handle to one opened upstream stream.
#[derive(Clone, Debug)]
pub(crate) struct Feed {
    pub chat_id: ChatId,
    pub replay: bool,
    tx: mpsc::UnboundedSender<FeedItem>,
}

impl Feed {
    /// Deliver a chunk. `false` once the pump dropped the stream.
    pub fn send(&self, chunk: &str) -> bool {
        self.tx
            .send(Some(Ok(Bytes::copy_from_slice(chunk.as_bytes()))))
            .is_ok()
    }

    /// Deliver a read error.
    pub fn fail(&self) {
        let _ = self.tx.send(Some(Err(UpstreamError::Status {
            status: 502,
            body: "bad gateway".into(),
        })));
    }

    /// End the stream cleanly.
    pub fn end(&self) {
        let _ = self.tx.send(None);
    }

    /// Whether the consumer dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct FakeState {
    opens: usize,
    feeds: Vec<Feed>,
    failures: HashMap<ChatId, u16>,
    hanging: HashSet<ChatId>,
}

/// Channel-backed event source.
#[derive(Default)]
pub(crate) struct FakeSource {
    state: Mutex<FakeState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make opens for `chat` fail with `status`.
    pub fn fail_with(&self, chat: &str, status: u16) {
        let _ = self.state.lock().failures.insert(ChatId::from(chat), status);
    }

    /// Make opens for `chat` never complete.
    pub fn hang_on_open(&self, chat: &str) {
        let _ = self.state.lock().hanging.insert(ChatId::from(chat));
    }

    /// Open attempts so far, including failed and hanging ones.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Successfully opened streams, in open order.
    pub fn feeds(&self) -> Vec<Feed> {
        self.state.lock().feeds.clone()
    }

    /// Successfully opened streams for one chat, in open order.
    pub fn feeds_for(&self, chat: &str) -> Vec<Feed> {
        self.state
            .lock()
            .feeds
            .iter()
            .filter(|f| f.chat_id.as_str() == chat)
            .cloned()
            .collect()
    }

    /// Wait until the `index`-th stream has been opened and return it.
    pub async fn wait_for_open(&self, index: usize) -> Feed {
        eventually(|| self.state.lock().feeds.len() > index).await;
        self.state.lock().feeds[index].clone()
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn open(&self, chat_id: &ChatId, replay: bool) -> Result<ByteStream, UpstreamError> {
        let hang = {
            let mut state = self.state.lock();
            state.opens += 1;
            if let Some(&status) = state.failures.get(chat_id) {
                return Err(UpstreamError::Status {
                    status,
                    body: "{\"error\":\"Chat not found\"}".into(),
                });
            }
            state.hanging.contains(chat_id)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<FeedItem>();
        self.state.lock().feeds.push(Feed {
            chat_id: chat_id.clone(),
            replay,
            tx,
        });
        Ok(Box::pin(async_stream::stream! {
            while let Some(Some(item)) = rx.recv().await {
                yield item;
            }
        }))
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
