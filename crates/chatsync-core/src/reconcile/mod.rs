//! Merge of optimistic local sends with authoritative change-feed events.
//!
//! The engine is a plain single-owner value: the runtime folds queued events
//! through it one at a time, so no locks guard the timelines.

mod timeline;

pub use timeline::{ConversationTimeline, InsertOutcome};

use std::collections::HashMap;

use tracing::debug;

use crate::error::{SendFailure, SyncError};
use crate::feed::StoreAck;
use crate::models::{
    ClientTempId, Conversation, DeliveryState, FeedEvent, FeedEventKind, FeedMessage, Message,
};

/// Effect of a store write result on the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed,
    /// Accepted without ids; confirmation arrives with the feed echo.
    AwaitingEcho,
    Failed(SendFailure),
    /// Conversation forgotten or message already confirmed.
    Ignored,
}

/// Conversation list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread: usize,
}

pub struct ReconciliationEngine {
    self_id: String,
    timelines: HashMap<String, ConversationTimeline>,
}

impl ReconciliationEngine {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            timelines: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    // ===== Tracking =====

    /// Start holding state for `conversation`. Returns false if already tracked.
    pub fn track(&mut self, conversation: Conversation) -> bool {
        if self.timelines.contains_key(&conversation.id) {
            return false;
        }
        self.timelines
            .insert(conversation.id.clone(), ConversationTimeline::new(conversation));
        true
    }

    pub fn forget(&mut self, conversation_id: &str) -> Option<ConversationTimeline> {
        self.timelines.remove(conversation_id)
    }

    pub fn is_tracked(&self, conversation_id: &str) -> bool {
        self.timelines.contains_key(conversation_id)
    }

    /// Track `conversation` and merge `messages` into it.
    pub fn seed(&mut self, conversation: Conversation, messages: Vec<Message>) -> usize {
        let id = conversation.id.clone();
        self.track(conversation);
        self.merge_history(&id, messages)
    }

    /// Merge a fetched page of confirmed messages through the insert path.
    /// Returns the number of entries that changed the timeline.
    pub fn merge_history(&mut self, conversation_id: &str, messages: Vec<Message>) -> usize {
        let Some(timeline) = self.timelines.get_mut(conversation_id) else {
            return 0;
        };
        let mut applied = 0;
        for message in messages {
            let Some(server_id) = message.server_id else {
                continue;
            };
            if message.conversation_id != conversation_id {
                continue;
            }
            let incoming = FeedMessage {
                server_id,
                client_temp_id: Some(message.client_temp_id),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                created_at: message.created_at,
            };
            if timeline.apply_insert(incoming) != InsertOutcome::Duplicate {
                applied += 1;
            }
        }
        debug!(conversation_id, applied, "merged history");
        applied
    }

    // ===== Sends =====

    /// Append a pending message and return its temp id.
    pub fn send(
        &mut self,
        conversation_id: &str,
        content: &str,
        now: u64,
    ) -> Result<ClientTempId, SyncError> {
        let message = Message::pending(conversation_id, self.self_id.clone(), content, now);
        let timeline = self.timeline_mut(conversation_id)?;
        let temp = message.client_temp_id.clone();
        timeline.push_pending(message);
        Ok(temp)
    }

    pub fn on_send_result(
        &mut self,
        conversation_id: &str,
        client_temp_id: &ClientTempId,
        result: Result<StoreAck, SendFailure>,
    ) -> SendOutcome {
        let self_id = self.self_id.clone();
        let Some(timeline) = self.timelines.get_mut(conversation_id) else {
            return SendOutcome::Ignored;
        };

        match result {
            Ok(StoreAck {
                server_id: Some(server_id),
                created_at: Some(created_at),
            }) => {
                if timeline.confirm_local(&self_id, client_temp_id, server_id, created_at) {
                    SendOutcome::Confirmed
                } else {
                    SendOutcome::Ignored
                }
            }
            Ok(_) => match timeline.find_local(&self_id, client_temp_id) {
                Some(message) if !message.is_confirmed() => SendOutcome::AwaitingEcho,
                _ => SendOutcome::Ignored,
            },
            Err(failure) => {
                let marked = timeline.update_local(&self_id, client_temp_id, |message| {
                    message.fail(failure.clone())
                });
                if marked {
                    SendOutcome::Failed(failure)
                } else {
                    SendOutcome::Ignored
                }
            }
        }
    }

    /// Put a failed message back to pending with a fresh local timestamp and
    /// the same temp id. Returns the content to resend.
    pub fn retry_send(
        &mut self,
        conversation_id: &str,
        client_temp_id: &ClientTempId,
        now: u64,
    ) -> Result<String, SyncError> {
        let self_id = self.self_id.clone();
        let timeline = self.timeline_mut(conversation_id)?;
        let failed = timeline
            .find_local(&self_id, client_temp_id)
            .is_some_and(Message::is_failed);
        if !failed {
            return Err(SyncError::NotRetriable {
                conversation_id: conversation_id.to_string(),
                client_temp_id: client_temp_id.clone(),
            });
        }

        let mut content = String::new();
        timeline.update_local(&self_id, client_temp_id, |message| {
            message.delivery_state = DeliveryState::Pending;
            message.failure = None;
            message.created_at = now;
            content = message.content.clone();
        });
        Ok(content)
    }

    /// Drop a failed message the user gave up on.
    pub fn discard_failed(
        &mut self,
        conversation_id: &str,
        client_temp_id: &ClientTempId,
    ) -> Result<Message, SyncError> {
        let self_id = self.self_id.clone();
        let timeline = self.timeline_mut(conversation_id)?;
        let failed = timeline
            .find_local(&self_id, client_temp_id)
            .is_some_and(Message::is_failed);
        match failed.then(|| timeline.remove_local(&self_id, client_temp_id)).flatten() {
            Some(message) => Ok(message),
            None => Err(SyncError::NotRetriable {
                conversation_id: conversation_id.to_string(),
                client_temp_id: client_temp_id.clone(),
            }),
        }
    }

    // ===== Feed =====

    /// Fold one validated feed event. Returns true when the timeline changed.
    pub fn on_feed_event(&mut self, event: FeedEvent) -> bool {
        let conversation_id = event.message.conversation_id.clone();
        let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
            debug!(conversation_id, "ignoring event for untracked conversation");
            return false;
        };

        let changed = match event.kind {
            FeedEventKind::Insert => timeline.apply_insert(event.message) != InsertOutcome::Duplicate,
            FeedEventKind::Update => timeline.apply_update(&event.message),
            FeedEventKind::Delete => timeline.apply_delete(&event.message.server_id),
        };
        debug!(conversation_id, kind = ?event.kind, changed, "applied feed event");
        changed
    }

    // ===== Read state =====

    /// Confirmed messages from others newer than the self read marker; 0 for
    /// untracked conversations.
    pub fn unread_count(&self, conversation_id: &str) -> usize {
        self.timelines
            .get(conversation_id)
            .map(|timeline| timeline.unread_count(&self.self_id))
            .unwrap_or(0)
    }

    /// Advance the read marker to `max(now, newest confirmed)`. Returns the
    /// marker to persist.
    pub fn mark_read(&mut self, conversation_id: &str, now: u64) -> Result<u64, SyncError> {
        let timeline = self.timeline_mut(conversation_id)?;
        let target = timeline.newest_confirmed_at().unwrap_or(0).max(now);
        Ok(timeline.mark_read(target))
    }

    // ===== Views =====

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.timelines
            .get(conversation_id)
            .map(ConversationTimeline::messages)
            .unwrap_or(&[])
    }

    pub fn timeline(&self, conversation_id: &str) -> Option<&ConversationTimeline> {
        self.timelines.get(conversation_id)
    }

    /// Tracked conversations, most recent activity first.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .timelines
            .values()
            .map(|timeline| ConversationSummary {
                conversation: timeline.conversation.clone(),
                unread: timeline.unread_count(&self.self_id),
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });
        summaries
    }

    fn timeline_mut(&mut self, conversation_id: &str) -> Result<&mut ConversationTimeline, SyncError> {
        self.timelines
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))
    }
}
