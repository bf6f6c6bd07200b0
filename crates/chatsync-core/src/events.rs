use crate::error::SendFailure;
use crate::feed::StoreAck;
use crate::models::{ClientTempId, FeedEvent, Message};
use crate::subscription::{ConnectivityStatus, SubscriptionState};

/// Items carried by the in-process event queue from subscription and I/O
/// tasks to the single consumer.
#[derive(Debug)]
pub enum SyncEvent {
    /// Validated change-feed event for one conversation.
    Feed {
        generation: u64,
        event: FeedEvent,
    },
    /// Subscription lifecycle transition.
    Status {
        conversation_id: String,
        generation: u64,
        state: SubscriptionState,
        attempt: u32,
    },
    /// The feed reattached without resume support; history must be re-fetched.
    ResyncRequested {
        conversation_id: String,
        generation: u64,
    },
    /// Outcome of a message-store write started by a send or retry.
    SendCompleted {
        conversation_id: String,
        client_temp_id: ClientTempId,
        result: Result<StoreAck, SendFailure>,
    },
    /// Result of a history fetch.
    History {
        conversation_id: String,
        messages: Vec<Message>,
    },
}

/// What changed after the consumer folded one queued event. The UI re-reads
/// state for the named conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    MessagesChanged {
        conversation_id: String,
    },
    ConnectivityChanged {
        conversation_id: String,
        status: ConnectivityStatus,
    },
    SendFailed {
        conversation_id: String,
        client_temp_id: ClientTempId,
        failure: SendFailure,
    },
}
