use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SendFailure;

/// Authoritative message id assigned by the message store.
///
/// Opaque on the wire. Decimal ids order by value (so "9" < "10") and sort
/// before every non-decimal id; non-decimal ids order lexicographically.
/// Equal values with different spellings ("007", "7") fall back to the raw
/// string so `Ord` agrees with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits without leading zeros, or None for a non-decimal id.
    fn decimal_digits(&self) -> Option<&str> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(self.0.trim_start_matches('0'))
    }
}

impl Ord for ServerId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.decimal_digits(), other.decimal_digits()) {
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ServerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Locally generated id attached to every send and echoed back by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientTempId(String);

impl ClientTempId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for an outgoing message.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientTempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientTempId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Sent locally, not yet confirmed by the store.
    Pending,
    /// Confirmed by the store; carries an authoritative id and timestamp.
    Confirmed,
    /// The send was rejected or timed out; waiting for an explicit retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub server_id: Option<ServerId>,
    pub client_temp_id: ClientTempId,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Server time once confirmed, local send time until then (ms).
    pub created_at: u64,
    pub delivery_state: DeliveryState,
    /// Reason of the last failed send, cleared on retry or confirmation.
    pub failure: Option<SendFailure>,
    /// Set when an update event replaced the original content.
    pub edited: bool,
}

impl Message {
    /// Optimistic local message with a fresh temp id.
    pub fn pending(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        sent_at: u64,
    ) -> Self {
        Self {
            server_id: None,
            client_temp_id: ClientTempId::generate(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            created_at: sent_at,
            delivery_state: DeliveryState::Pending,
            failure: None,
            edited: false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery_state == DeliveryState::Confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.delivery_state == DeliveryState::Failed
    }

    /// Whether this entry is the local copy of `(sender_id, client_temp_id)`.
    pub fn matches_local(&self, sender_id: &str, client_temp_id: &ClientTempId) -> bool {
        self.sender_id == sender_id && &self.client_temp_id == client_temp_id
    }

    /// Position key within a conversation. Entries without a server id sort
    /// before confirmed entries sharing the same timestamp.
    pub fn sort_key(&self) -> (u64, Option<&ServerId>) {
        (self.created_at, self.server_id.as_ref())
    }

    /// Upgrade to confirmed with the authoritative id and timestamp.
    pub fn confirm(&mut self, server_id: ServerId, created_at: u64) {
        self.server_id = Some(server_id);
        self.created_at = created_at;
        self.delivery_state = DeliveryState::Confirmed;
        self.failure = None;
    }

    pub fn fail(&mut self, failure: SendFailure) {
        self.delivery_state = DeliveryState::Failed;
        self.failure = Some(failure);
    }
}
