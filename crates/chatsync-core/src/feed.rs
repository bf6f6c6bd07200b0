//! Collaborator contracts consumed by the sync core.
//!
//! The change feed, message store and session are owned by the backend
//! integration. These traits are object-safe so the runtime can hold them as
//! `Arc<dyn ...>` and tests can swap in the in-memory versions from
//! [`crate::memory`].

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::{StoreError, TransportError};
use crate::models::{ClientTempId, Message, ServerId};

/// Raw events for one conversation. An `Err` item or the end of the stream
/// is the feed's disconnect signal.
pub type FeedStream = BoxStream<'static, Result<Value, TransportError>>;

pub trait ChangeFeed: Send + Sync {
    /// Attach to the events of `conversation_id`. With `since`, the feed must
    /// first replay every event committed after that cursor.
    fn attach<'a>(
        &'a self,
        conversation_id: &'a str,
        since: Option<u64>,
    ) -> BoxFuture<'a, Result<FeedStream, TransportError>>;

    /// Whether `attach` honors `since`. Feeds that cannot resume get a full
    /// history re-fetch after every reconnect instead.
    fn supports_resume(&self) -> bool {
        true
    }
}

/// Acknowledgement of a message write. Ids are optional: some stores only
/// confirm through the change-feed echo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreAck {
    pub server_id: Option<ServerId>,
    pub created_at: Option<u64>,
}

pub trait MessageStore: Send + Sync {
    fn create_message<'a>(
        &'a self,
        conversation_id: &'a str,
        content: &'a str,
        client_temp_id: &'a ClientTempId,
    ) -> BoxFuture<'a, Result<StoreAck, StoreError>>;

    fn mark_read<'a>(
        &'a self,
        conversation_id: &'a str,
        participant_id: &'a str,
        timestamp: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Most recent confirmed messages of a conversation, oldest first.
    fn fetch_recent<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>>;
}

pub trait SessionProvider: Send + Sync {
    /// Id of the signed-in user.
    fn self_id(&self) -> String;
}

/// Bundle of collaborators handed to the runtime.
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn ChangeFeed>,
    pub store: Arc<dyn MessageStore>,
    pub session: Arc<dyn SessionProvider>,
}
