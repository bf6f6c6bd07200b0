use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
}

/// Conversation metadata as known to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Participant ids, most recent sender first
    pub participants: Vec<String>,
    /// Timestamp (ms) of the newest message seen
    pub last_message_at: u64,
    pub status: ConversationStatus,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: Vec::new(),
            last_message_at: 0,
            status: ConversationStatus::Active,
        }
    }

    pub fn with_participants<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.participants = participants.into_iter().map(Into::into).collect();
        self
    }

    /// Record a message arrival: bump `last_message_at` (never backwards)
    /// and move the sender to the front of the participant list.
    pub fn record_message(&mut self, sender_id: &str, created_at: u64) {
        self.last_message_at = self.last_message_at.max(created_at);
        if let Some(pos) = self.participants.iter().position(|p| p == sender_id) {
            if pos == 0 {
                return;
            }
            let sender = self.participants.remove(pos);
            self.participants.insert(0, sender);
        } else {
            self.participants.insert(0, sender_id.to_string());
        }
    }
}
