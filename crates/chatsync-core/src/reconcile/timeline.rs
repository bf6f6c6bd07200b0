use crate::models::{ClientTempId, Conversation, FeedMessage, Message, ServerId};

/// What an insert did to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The server id was already present; replayed event.
    Duplicate,
    /// A local pending/failed copy was upgraded in place.
    Confirmed,
    Inserted,
}

/// Merged, ordered message sequence of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    pub conversation: Conversation,
    messages: Vec<Message>,
    /// Self read marker (ms)
    last_read_at: u64,
}

impl ConversationTimeline {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            last_read_at: 0,
        }
    }

    // ===== Getters =====

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_read_at(&self) -> u64 {
        self.last_read_at
    }

    pub fn find_local(&self, sender_id: &str, client_temp_id: &ClientTempId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.matches_local(sender_id, client_temp_id))
    }

    pub fn contains_server_id(&self, server_id: &ServerId) -> bool {
        self.position_of_server(server_id).is_some()
    }

    /// Confirmed messages from others newer than the read marker.
    pub fn unread_count(&self, self_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_confirmed() && m.sender_id != self_id && m.created_at > self.last_read_at)
            .count()
    }

    pub fn newest_confirmed_at(&self) -> Option<u64> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_confirmed())
            .map(|m| m.created_at)
    }

    // ===== Mutations =====

    /// Apply an authoritative insert: drop replays, upgrade the matching
    /// local copy, or insert in sorted position.
    pub fn apply_insert(&mut self, incoming: FeedMessage) -> InsertOutcome {
        if self.contains_server_id(&incoming.server_id) {
            return InsertOutcome::Duplicate;
        }

        let local = incoming.client_temp_id.as_ref().and_then(|temp| {
            self.messages
                .iter()
                .position(|m| m.server_id.is_none() && m.matches_local(&incoming.sender_id, temp))
        });

        self.conversation
            .record_message(&incoming.sender_id, incoming.created_at);

        match local {
            Some(pos) => {
                let mut message = self.messages.remove(pos);
                message.confirm(incoming.server_id, incoming.created_at);
                message.content = incoming.content;
                self.insert_sorted(message);
                InsertOutcome::Confirmed
            }
            None => {
                self.insert_sorted(incoming.into_confirmed());
                InsertOutcome::Inserted
            }
        }
    }

    /// Confirm a local copy from a store ack. Returns false when the entry is
    /// gone or already confirmed.
    pub fn confirm_local(
        &mut self,
        sender_id: &str,
        client_temp_id: &ClientTempId,
        server_id: ServerId,
        created_at: u64,
    ) -> bool {
        if self.contains_server_id(&server_id) {
            // The echo won the race; drop the now redundant local copy
            let before = self.messages.len();
            self.messages
                .retain(|m| m.server_id.is_some() || !m.matches_local(sender_id, client_temp_id));
            return self.messages.len() != before;
        }
        let Some(pos) = self.position_of_unconfirmed(sender_id, client_temp_id) else {
            return false;
        };
        let mut message = self.messages.remove(pos);
        message.confirm(server_id, created_at);
        self.conversation.record_message(sender_id, created_at);
        self.insert_sorted(message);
        true
    }

    /// Last write wins on content.
    pub fn apply_update(&mut self, incoming: &FeedMessage) -> bool {
        match self.position_of_server(&incoming.server_id) {
            Some(pos) => {
                let message = &mut self.messages[pos];
                if message.content != incoming.content {
                    message.content = incoming.content.clone();
                    message.edited = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn apply_delete(&mut self, server_id: &ServerId) -> bool {
        match self.position_of_server(server_id) {
            Some(pos) => {
                self.messages.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Append an optimistic local message.
    pub fn push_pending(&mut self, message: Message) {
        self.insert_sorted(message);
    }

    /// Run `update` on the unconfirmed local copy and re-sort it.
    pub fn update_local(
        &mut self,
        sender_id: &str,
        client_temp_id: &ClientTempId,
        update: impl FnOnce(&mut Message),
    ) -> bool {
        let Some(pos) = self.position_of_unconfirmed(sender_id, client_temp_id) else {
            return false;
        };
        let mut message = self.messages.remove(pos);
        update(&mut message);
        self.insert_sorted(message);
        true
    }

    pub fn remove_local(&mut self, sender_id: &str, client_temp_id: &ClientTempId) -> Option<Message> {
        self.position_of_unconfirmed(sender_id, client_temp_id)
            .map(|pos| self.messages.remove(pos))
    }

    /// Move the read marker forward to `timestamp`. Never moves backwards.
    pub fn mark_read(&mut self, timestamp: u64) -> u64 {
        self.last_read_at = self.last_read_at.max(timestamp);
        self.last_read_at
    }

    // ===== Internals =====

    fn position_of_server(&self, server_id: &ServerId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.server_id.as_ref() == Some(server_id))
    }

    fn position_of_unconfirmed(&self, sender_id: &str, client_temp_id: &ClientTempId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.server_id.is_none() && m.matches_local(sender_id, client_temp_id))
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.sort_key();
        let pos = self.messages.partition_point(|m| m.sort_key() <= key);
        self.messages.insert(pos, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryState;

    fn remote(server_id: &str, sender: &str, created_at: u64) -> FeedMessage {
        FeedMessage {
            server_id: ServerId::from(server_id),
            client_temp_id: None,
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            content: format!("from {sender}"),
            created_at,
        }
    }

    fn ids(timeline: &ConversationTimeline) -> Vec<String> {
        timeline
            .messages()
            .iter()
            .map(|m| {
                m.server_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| format!("~{}", m.content))
            })
            .collect()
    }

    #[test]
    fn test_out_of_order_inserts_are_sorted() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        timeline.apply_insert(remote("3", "bob", 300));
        timeline.apply_insert(remote("1", "bob", 100));
        timeline.apply_insert(remote("2", "bob", 300));
        assert_eq!(ids(&timeline), vec!["1", "2", "3"]);
        assert_eq!(timeline.conversation.last_message_at, 300);
    }

    #[test]
    fn test_same_timestamp_mixed_ids_sort_in_any_arrival_order() {
        let arrivals = [["10", "1a", "9"], ["9", "1a", "10"], ["1a", "10", "9"]];
        for order in arrivals {
            let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
            for id in order {
                timeline.apply_insert(remote(id, "bob", 500));
            }
            assert_eq!(ids(&timeline), vec!["9", "10", "1a"], "arrival {order:?}");
        }
    }

    #[test]
    fn test_replayed_insert_is_ignored() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        assert_eq!(timeline.apply_insert(remote("1", "bob", 100)), InsertOutcome::Inserted);
        assert_eq!(timeline.apply_insert(remote("1", "bob", 100)), InsertOutcome::Duplicate);
        assert_eq!(timeline.messages().len(), 1);
    }

    #[test]
    fn test_echo_upgrades_pending_and_resorts() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        let pending = Message::pending("c1", "me", "hello", 500);
        let temp = pending.client_temp_id.clone();
        timeline.push_pending(pending);
        timeline.apply_insert(remote("1", "bob", 400));

        let mut echo = remote("2", "me", 350);
        echo.client_temp_id = Some(temp.clone());
        echo.content = "hello".into();
        assert_eq!(timeline.apply_insert(echo), InsertOutcome::Confirmed);

        assert_eq!(ids(&timeline), vec!["2", "1"]);
        let confirmed = timeline.find_local("me", &temp).unwrap();
        assert_eq!(confirmed.delivery_state, DeliveryState::Confirmed);
        assert_eq!(confirmed.created_at, 350);
    }

    #[test]
    fn test_pending_sorts_before_confirmed_with_same_timestamp() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        timeline.apply_insert(remote("1", "bob", 100));
        timeline.push_pending(Message::pending("c1", "me", "mine", 100));
        assert_eq!(ids(&timeline), vec!["~mine", "1"]);
    }

    #[test]
    fn test_update_and_delete_by_server_id() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        timeline.apply_insert(remote("1", "bob", 100));

        let mut edit = remote("1", "bob", 100);
        edit.content = "edited".into();
        assert!(timeline.apply_update(&edit));
        assert!(!timeline.apply_update(&remote("9", "bob", 100)));
        assert_eq!(timeline.messages()[0].content, "edited");
        assert!(timeline.messages()[0].edited);

        assert!(!timeline.apply_delete(&ServerId::from("9")));
        assert!(timeline.apply_delete(&ServerId::from("1")));
        assert!(timeline.messages().is_empty());
    }

    #[test]
    fn test_ack_after_echo_drops_local_copy() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        let pending = Message::pending("c1", "me", "hi", 100);
        let temp = pending.client_temp_id.clone();
        timeline.push_pending(pending);

        // Echo without the temp id cannot be matched, so it lands separately
        timeline.apply_insert(remote("5", "me", 110));
        assert_eq!(timeline.messages().len(), 2);

        assert!(timeline.confirm_local("me", &temp, ServerId::from("5"), 110));
        assert_eq!(ids(&timeline), vec!["5"]);
    }

    #[test]
    fn test_unread_counts_confirmed_messages_from_others() {
        let mut timeline = ConversationTimeline::new(Conversation::new("c1"));
        timeline.apply_insert(remote("1", "bob", 100));
        timeline.apply_insert(remote("2", "me", 200));
        timeline.apply_insert(remote("3", "bob", 300));
        timeline.push_pending(Message::pending("c1", "me", "draft", 400));
        assert_eq!(timeline.unread_count("me"), 2);

        timeline.mark_read(150);
        assert_eq!(timeline.unread_count("me"), 1);
        // Marker never moves backwards
        assert_eq!(timeline.mark_read(50), 150);
        assert_eq!(timeline.newest_confirmed_at(), Some(300));
    }
}
