use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ClientTempId;

/// Failure talking to the change feed. Always recoverable: the owning
/// subscription goes into backoff and retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Attach did not complete within the configured timeout.
    #[error("attach timed out after {0:?}")]
    Timeout(Duration),
    /// The feed dropped an established stream.
    #[error("feed disconnected: {0}")]
    Disconnected(String),
    /// The feed could not be reached at all.
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "transport_timeout",
            TransportError::Disconnected(_) => "transport_disconnected",
            TransportError::Unavailable(_) => "transport_unavailable",
        }
    }
}

/// A feed event that could not be interpreted. Dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("event does not match the expected shape: {0}")]
    Shape(String),
    #[error("event field '{0}' is empty")]
    EmptyField(&'static str),
    #[error("event for conversation '{actual}' arrived on subscription '{expected}'")]
    ConversationMismatch { expected: String, actual: String },
}

impl MalformedEvent {
    pub fn code(&self) -> &'static str {
        "malformed_event"
    }
}

/// Why an optimistic send ended up `failed`. Surfaced to the UI for an
/// explicit user retry; never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SendFailure {
    /// The message store refused the write.
    #[error("message rejected: {0}")]
    Rejected(String),
    /// No acknowledgement within the send timeout. The write may still have
    /// succeeded server-side; a late echo confirms the message.
    #[error("send timed out after {0} ms")]
    Timeout(u64),
    /// The store could not be reached.
    #[error("send transport failure: {0}")]
    Transport(String),
}

impl SendFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SendFailure::Rejected(_) => "send_rejected",
            SendFailure::Timeout(_) => "send_timeout",
            SendFailure::Transport(_) => "send_transport",
        }
    }
}

/// Error returned by the message store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store rejected the request: {0}")]
    Rejected(String),
    #[error("store unreachable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Rejected(_) => "store_rejected",
            StoreError::Unavailable(_) => "store_unavailable",
        }
    }
}

impl From<StoreError> for SendFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(reason) => SendFailure::Rejected(reason),
            StoreError::Unavailable(reason) => SendFailure::Transport(reason),
        }
    }
}

/// Top-level error for runtime construction, configuration and user calls.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync runtime must be created inside a tokio runtime")]
    NoAsyncRuntime,
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("conversation '{0}' is not tracked")]
    UnknownConversation(String),
    #[error("no failed message '{client_temp_id}' in conversation '{conversation_id}'")]
    NotRetriable {
        conversation_id: String,
        client_temp_id: ClientTempId,
    },
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NoAsyncRuntime => "no_async_runtime",
            SyncError::ConfigIo { .. } => "config_io",
            SyncError::ConfigParse { .. } => "config_parse",
            SyncError::InvalidConfig(_) => "invalid_config",
            SyncError::UnknownConversation(_) => "unknown_conversation",
            SyncError::NotRetriable { .. } => "not_retriable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_send_failures() {
        assert_eq!(
            SendFailure::from(StoreError::Rejected("too long".into())),
            SendFailure::Rejected("too long".into())
        );
        assert_eq!(
            SendFailure::from(StoreError::Unavailable("dns".into())).code(),
            "send_transport"
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(10)).code(),
            "transport_timeout"
        );
        assert_eq!(MalformedEvent::EmptyField("sender_id").code(), "malformed_event");
        assert_eq!(SendFailure::Timeout(15_000).code(), "send_timeout");
        assert_eq!(
            SyncError::UnknownConversation("c1".into()).code(),
            "unknown_conversation"
        );
    }

    #[test]
    fn test_not_retriable_names_message() {
        let err = SyncError::NotRetriable {
            conversation_id: "c1".into(),
            client_temp_id: ClientTempId::from("tmp-7"),
        };
        assert_eq!(err.code(), "not_retriable");
        assert_eq!(
            err.to_string(),
            "no failed message 'tmp-7' in conversation 'c1'"
        );
    }
}
