pub mod conversation;
pub mod feed_event;
pub mod message;

pub use conversation::{Conversation, ConversationStatus};
pub use feed_event::{FeedEvent, FeedEventKind, FeedMessage};
pub use message::{ClientTempId, DeliveryState, Message, ServerId};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
