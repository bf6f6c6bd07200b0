//! In-process collaborators.
//!
//! `InMemoryChangeFeed`, `InMemoryMessageStore` and `StaticSession` satisfy
//! the contracts in [`crate::feed`] without a backend. The demo CLI and the
//! tests drive transport drops, outages and rejected writes through them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{StoreError, TransportError};
use crate::feed::{
    ChangeFeed, Collaborators, FeedStream, MessageStore, SessionProvider, StoreAck,
};
use crate::models::{now_ms, ClientTempId, FeedEvent, FeedMessage, Message, ServerId};

type LiveSender = mpsc::UnboundedSender<Result<Value, TransportError>>;

#[derive(Default)]
struct FeedInner {
    /// Every published event per conversation as `(committed_at, payload)`
    log: HashMap<String, Vec<(u64, Value)>>,
    live: HashMap<String, Vec<LiveSender>>,
    attach_calls: Vec<(String, Option<u64>)>,
    unavailable: bool,
    hang_attach: bool,
}

/// Change feed backed by an in-memory event log.
pub struct InMemoryChangeFeed {
    inner: Mutex<FeedInner>,
    supports_resume: bool,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FeedInner::default()),
            supports_resume: true,
        }
    }

    /// A feed that ignores `since` cursors.
    pub fn without_resume() -> Self {
        Self {
            inner: Mutex::new(FeedInner::default()),
            supports_resume: false,
        }
    }

    /// Append a validated event to the log and push it to live attachments.
    pub fn publish(&self, event: &FeedEvent) {
        self.publish_raw(event.conversation_id(), event.committed_at, event.to_value());
    }

    /// Append an arbitrary payload, e.g. a malformed one.
    pub fn publish_raw(&self, conversation_id: &str, committed_at: u64, payload: Value) {
        let mut inner = self.inner.lock();
        inner
            .log
            .entry(conversation_id.to_string())
            .or_default()
            .push((committed_at, payload.clone()));
        if let Some(senders) = inner.live.get_mut(conversation_id) {
            senders.retain(|tx| tx.send(Ok(payload.clone())).is_ok());
        }
    }

    /// Drop every live attachment of `conversation_id` with a transport error.
    pub fn disconnect(&self, conversation_id: &str) {
        let senders = self.inner.lock().live.remove(conversation_id);
        for tx in senders.into_iter().flatten() {
            let _ = tx.send(Err(TransportError::Disconnected("connection reset".into())));
        }
    }

    pub fn disconnect_all(&self) {
        let live = std::mem::take(&mut self.inner.lock().live);
        for tx in live.into_values().flatten() {
            let _ = tx.send(Err(TransportError::Disconnected("connection reset".into())));
        }
    }

    /// While unavailable every attach fails immediately.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// While hanging every attach never completes (exercises the attach timeout).
    pub fn set_hang_attach(&self, hang: bool) {
        self.inner.lock().hang_attach = hang;
    }

    /// `(conversation_id, since)` of every attach request, in order.
    pub fn attach_calls(&self) -> Vec<(String, Option<u64>)> {
        self.inner.lock().attach_calls.clone()
    }

    pub fn live_attachments(&self, conversation_id: &str) -> usize {
        self.inner
            .lock()
            .live
            .get(conversation_id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn open_stream(&self, conversation_id: &str, since: Option<u64>) -> Result<Option<FeedStream>, TransportError> {
        let mut inner = self.inner.lock();
        inner.attach_calls.push((conversation_id.to_string(), since));
        if inner.unavailable {
            return Err(TransportError::Unavailable("feed offline".into()));
        }
        if inner.hang_attach {
            return Ok(None);
        }

        let replay: Vec<Result<Value, TransportError>> = match since {
            Some(cursor) if self.supports_resume => inner
                .log
                .get(conversation_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|(committed_at, _)| *committed_at > cursor)
                        .map(|(_, payload)| Ok(payload.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .live
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);

        let live = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Some(stream::iter(replay).chain(live).boxed()))
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for InMemoryChangeFeed {
    fn attach<'a>(
        &'a self,
        conversation_id: &'a str,
        since: Option<u64>,
    ) -> BoxFuture<'a, Result<FeedStream, TransportError>> {
        Box::pin(async move {
            match self.open_stream(conversation_id, since) {
                Ok(Some(stream)) => Ok(stream),
                Ok(None) => futures::future::pending().await,
                Err(err) => Err(err),
            }
        })
    }

    fn supports_resume(&self) -> bool {
        self.supports_resume
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack carries the server id and timestamp.
    WithIds,
    /// Ack is empty; confirmation arrives only through the feed echo.
    EchoOnly,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    last_created_at: u64,
    messages: HashMap<String, Vec<Message>>,
    read_marks: Vec<(String, String, u64)>,
    reject_with: Option<StoreError>,
    hang_writes: bool,
}

/// Message store that assigns sequential server ids and echoes writes into
/// an optional [`InMemoryChangeFeed`].
pub struct InMemoryMessageStore {
    feed: Option<Arc<InMemoryChangeFeed>>,
    sender_id: String,
    ack_mode: AckMode,
    inner: Mutex<StoreInner>,
}

impl InMemoryMessageStore {
    /// `sender_id` is the identity writes are attributed to.
    pub fn new(sender_id: impl Into<String>, feed: Option<Arc<InMemoryChangeFeed>>) -> Self {
        Self {
            feed,
            sender_id: sender_id.into(),
            ack_mode: AckMode::EchoOnly,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Reject every write with `error` until cleared with `None`.
    pub fn set_reject(&self, error: Option<StoreError>) {
        self.inner.lock().reject_with = error;
    }

    /// While set, writes never complete (exercises the send timeout).
    pub fn set_hang_writes(&self, hang: bool) {
        self.inner.lock().hang_writes = hang;
    }

    /// Simulate a message from another participant.
    pub fn insert_remote(&self, conversation_id: &str, sender_id: &str, content: &str) -> FeedMessage {
        let message = {
            let mut inner = self.inner.lock();
            let message = Self::assign(&mut inner, conversation_id, sender_id, content, None);
            inner
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone().into_confirmed());
            message
        };
        if let Some(feed) = &self.feed {
            feed.publish(&FeedEvent::insert(message.clone()));
        }
        message
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// `(conversation_id, participant_id, timestamp)` of every persisted read mark.
    pub fn read_marks(&self) -> Vec<(String, String, u64)> {
        self.inner.lock().read_marks.clone()
    }

    fn assign(
        inner: &mut StoreInner,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        client_temp_id: Option<&ClientTempId>,
    ) -> FeedMessage {
        inner.next_id += 1;
        // Strictly increasing timestamps keep the log ordering deterministic
        let created_at = now_ms().max(inner.last_created_at + 1);
        inner.last_created_at = created_at;
        FeedMessage {
            server_id: ServerId::new(inner.next_id.to_string()),
            client_temp_id: client_temp_id.cloned(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at,
        }
    }
}

impl MessageStore for InMemoryMessageStore {
    fn create_message<'a>(
        &'a self,
        conversation_id: &'a str,
        content: &'a str,
        client_temp_id: &'a ClientTempId,
    ) -> BoxFuture<'a, Result<StoreAck, StoreError>> {
        Box::pin(async move {
            let outcome = {
                let mut inner = self.inner.lock();
                if inner.hang_writes {
                    None
                } else if let Some(err) = inner.reject_with.clone() {
                    Some(Err(err))
                } else {
                    let message = Self::assign(
                        &mut inner,
                        conversation_id,
                        &self.sender_id,
                        content,
                        Some(client_temp_id),
                    );
                    inner
                        .messages
                        .entry(conversation_id.to_string())
                        .or_default()
                        .push(message.clone().into_confirmed());
                    Some(Ok(message))
                }
            };

            let message = match outcome {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(err),
                None => return futures::future::pending().await,
            };

            if let Some(feed) = &self.feed {
                feed.publish(&FeedEvent::insert(message.clone()));
            }

            Ok(match self.ack_mode {
                AckMode::WithIds => StoreAck {
                    server_id: Some(message.server_id),
                    created_at: Some(message.created_at),
                },
                AckMode::EchoOnly => StoreAck::default(),
            })
        })
    }

    fn mark_read<'a>(
        &'a self,
        conversation_id: &'a str,
        participant_id: &'a str,
        timestamp: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.reject_with.clone() {
                return Err(err);
            }
            inner.read_marks.push((
                conversation_id.to_string(),
                participant_id.to_string(),
                timestamp,
            ));
            Ok(())
        })
    }

    fn fetch_recent<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let all = inner.messages.get(conversation_id).map(Vec::as_slice).unwrap_or(&[]);
            let start = all.len().saturating_sub(limit);
            Ok(all[start..].to_vec())
        })
    }
}

/// Session with a fixed user id.
#[derive(Debug, Clone)]
pub struct StaticSession {
    self_id: String,
}

impl StaticSession {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
        }
    }
}

impl SessionProvider for StaticSession {
    fn self_id(&self) -> String {
        self.self_id.clone()
    }
}

/// Feed, store and session wired together: writes to the store echo into
/// the feed.
#[derive(Clone)]
pub struct InMemoryBackend {
    pub feed: Arc<InMemoryChangeFeed>,
    pub store: Arc<InMemoryMessageStore>,
    pub session: Arc<StaticSession>,
}

impl InMemoryBackend {
    pub fn new(self_id: &str) -> Self {
        Self::with_feed(self_id, InMemoryChangeFeed::new(), AckMode::EchoOnly)
    }

    pub fn with_feed(self_id: &str, feed: InMemoryChangeFeed, ack_mode: AckMode) -> Self {
        let feed = Arc::new(feed);
        let store = InMemoryMessageStore::new(self_id, Some(feed.clone())).with_ack_mode(ack_mode);
        Self {
            feed,
            store: Arc::new(store),
            session: Arc::new(StaticSession::new(self_id)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            feed: self.feed.clone(),
            store: self.store.clone(),
            session: self.session.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(server_id: &str, created_at: u64) -> FeedEvent {
        FeedEvent::insert(FeedMessage {
            server_id: ServerId::from(server_id),
            client_temp_id: None,
            conversation_id: "c1".into(),
            sender_id: "bob".into(),
            content: format!("msg {server_id}"),
            created_at,
        })
    }

    #[tokio::test]
    async fn test_attach_with_cursor_replays_newer_events() {
        let feed = InMemoryChangeFeed::new();
        feed.publish(&insert("1", 10));
        feed.publish(&insert("2", 20));
        feed.publish(&insert("3", 30));

        let mut stream = feed.attach("c1", Some(15)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first["message"]["server_id"], "2");
        assert_eq!(second["message"]["server_id"], "3");

        feed.publish(&insert("4", 40));
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live["message"]["server_id"], "4");
    }

    #[tokio::test]
    async fn test_feed_without_resume_ignores_cursor() {
        let feed = InMemoryChangeFeed::without_resume();
        feed.publish(&insert("1", 10));
        let _stream = feed.attach("c1", Some(0)).await.unwrap();
        assert_eq!(feed.live_attachments("c1"), 1);
        assert!(!feed.supports_resume());
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_with_error() {
        let feed = InMemoryChangeFeed::new();
        let mut stream = feed.attach("c1", None).await.unwrap();
        feed.disconnect("c1");
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::Disconnected(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_feed_rejects_attach() {
        let feed = InMemoryChangeFeed::new();
        feed.set_available(false);
        let err = feed.attach("c1", None).await.err().unwrap();
        assert_eq!(err.code(), "transport_unavailable");
        assert_eq!(feed.attach_calls(), vec![("c1".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_store_echoes_write_with_temp_id() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let store = InMemoryMessageStore::new("me", Some(feed.clone()));
        let mut stream = feed.attach("c1", None).await.unwrap();

        let temp = ClientTempId::from("tmp-1");
        let ack = store.create_message("c1", "hello", &temp).await.unwrap();
        assert_eq!(ack, StoreAck::default());

        let echo = FeedEvent::from_value(stream.next().await.unwrap().unwrap(), "c1").unwrap();
        assert_eq!(echo.message.client_temp_id, Some(temp));
        assert_eq!(echo.message.sender_id, "me");
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_recent_returns_tail() {
        let store = InMemoryMessageStore::new("me", None).with_ack_mode(AckMode::WithIds);
        for i in 0..5 {
            store.insert_remote("c1", "bob", &format!("m{i}"));
        }
        let recent = store.fetch_recent("c1", 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }
}
