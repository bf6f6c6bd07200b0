//! Realtime conversation sync core: per-conversation change-feed
//! subscriptions, optimistic message reconciliation, chat window management
//! and presence.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod feed;
pub mod memory;
pub mod models;
pub mod presence;
pub mod reconcile;
pub mod runtime;
pub mod subscription;
pub mod tracing_setup;
pub mod windows;

pub use config::CoreConfig;
pub use error::{MalformedEvent, SendFailure, StoreError, SyncError, TransportError};
pub use events::{SyncEvent, SyncUpdate};
pub use feed::{ChangeFeed, Collaborators, MessageStore, SessionProvider, StoreAck};
pub use runtime::ChatSync;
pub use subscription::{ConnectivityStatus, SubscriptionManager, SubscriptionState};
pub use windows::{WindowManager, WindowMode, WindowTransition};
