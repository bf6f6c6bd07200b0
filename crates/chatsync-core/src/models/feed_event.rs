use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{ClientTempId, DeliveryState, Message, ServerId};
use crate::error::MalformedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEventKind {
    Insert,
    Update,
    Delete,
}

/// Message record as carried by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub server_id: ServerId,
    /// Echo of the sender's temp id for messages that round-tripped a local send
    #[serde(default)]
    pub client_temp_id: Option<ClientTempId>,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: u64,
}

impl FeedMessage {
    /// Convert to a confirmed timeline entry. Remote messages without an
    /// echoed temp id reuse the server id so identity stays stable.
    pub fn into_confirmed(self) -> Message {
        let client_temp_id = self
            .client_temp_id
            .unwrap_or_else(|| ClientTempId::new(self.server_id.as_str()));
        Message {
            server_id: Some(self.server_id),
            client_temp_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            created_at: self.created_at,
            delivery_state: DeliveryState::Confirmed,
            failure: None,
            edited: false,
        }
    }
}

/// Validated change-feed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    #[serde(rename = "type")]
    pub kind: FeedEventKind,
    /// Feed commit time (ms); drives the subscription's resume cursor
    #[serde(default)]
    pub committed_at: u64,
    pub message: FeedMessage,
}

impl FeedEvent {
    pub fn insert(message: FeedMessage) -> Self {
        Self {
            kind: FeedEventKind::Insert,
            committed_at: message.created_at,
            message,
        }
    }

    pub fn update(message: FeedMessage, committed_at: u64) -> Self {
        Self {
            kind: FeedEventKind::Update,
            committed_at,
            message,
        }
    }

    pub fn delete(message: FeedMessage, committed_at: u64) -> Self {
        Self {
            kind: FeedEventKind::Delete,
            committed_at,
            message,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.message.conversation_id
    }

    /// Parse and validate a raw feed payload received on the subscription
    /// for `expected_conversation`.
    pub fn from_value(value: Value, expected_conversation: &str) -> Result<Self, MalformedEvent> {
        let mut event: FeedEvent =
            serde_json::from_value(value).map_err(|e| MalformedEvent::Shape(e.to_string()))?;

        if event.message.server_id.as_str().is_empty() {
            return Err(MalformedEvent::EmptyField("server_id"));
        }
        if event.message.conversation_id.is_empty() {
            return Err(MalformedEvent::EmptyField("conversation_id"));
        }
        if event.kind == FeedEventKind::Insert && event.message.sender_id.is_empty() {
            return Err(MalformedEvent::EmptyField("sender_id"));
        }
        if event.message.conversation_id != expected_conversation {
            return Err(MalformedEvent::ConversationMismatch {
                expected: expected_conversation.to_string(),
                actual: event.message.conversation_id,
            });
        }
        if event
            .message
            .client_temp_id
            .as_ref()
            .is_some_and(|id| id.as_str().is_empty())
        {
            event.message.client_temp_id = None;
        }
        if event.committed_at == 0 {
            event.committed_at = event.message.created_at;
        }
        Ok(event)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
