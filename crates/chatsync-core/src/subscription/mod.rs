//! Per-conversation change-feed subscriptions.
//!
//! The [`SubscriptionManager`] owns a registry with exactly one entry per
//! conversation id. Each entry is backed by a tokio task (see `task.rs`) that
//! attaches to the feed, forwards validated events into the shared event
//! queue, and reattaches with exponential backoff when the transport drops.
//! The registry is guarded by a single mutex; every operation on it is short
//! and never awaits while holding the lock.

mod backoff;
mod task;

pub use backoff::BackoffPolicy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::events::SyncEvent;
use crate::feed::ChangeFeed;
use task::SubscriptionTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Registered but not running (the event consumer went away).
    Idle,
    Connecting,
    Live,
    Backoff,
    /// Retries exhausted; still retrying at the maximum cadence.
    Failed,
}

impl SubscriptionState {
    pub fn connectivity(self) -> ConnectivityStatus {
        match self {
            SubscriptionState::Live => ConnectivityStatus::Live,
            SubscriptionState::Failed => ConnectivityStatus::Offline,
            SubscriptionState::Idle
            | SubscriptionState::Connecting
            | SubscriptionState::Backoff => ConnectivityStatus::Reconnecting,
        }
    }
}

/// Per-conversation connectivity signal shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Live,
    Reconnecting,
    Offline,
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub conversation_id: String,
    pub state: SubscriptionState,
    /// Commit time (ms) of the last applied event; `None` before the first attach
    pub resume_cursor: Option<u64>,
    /// Consecutive failed attach attempts
    pub attempt: u32,
    /// Distinguishes successive subscriptions to the same conversation
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub conversation_id: String,
    pub generation: u64,
}

/// Subscribe/unsubscribe seam used by the window manager.
pub trait SubscriptionControl {
    fn subscribe(&self, conversation_id: &str) -> SubscriptionHandle;
    fn unsubscribe(&self, conversation_id: &str);
}

struct RegistryEntry {
    snapshot: Subscription,
    cancel_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<HashMap<String, RegistryEntry>>>;

/// Update the snapshot of `conversation_id` if it still belongs to
/// `generation`. Returns false when the entry was removed or replaced.
fn update_entry(
    registry: &Registry,
    conversation_id: &str,
    generation: u64,
    update: impl FnOnce(&mut Subscription),
) -> bool {
    let mut entries = registry.lock();
    match entries.get_mut(conversation_id) {
        Some(entry) if entry.snapshot.generation == generation => {
            update(&mut entry.snapshot);
            true
        }
        _ => false,
    }
}

pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    events: mpsc::Sender<SyncEvent>,
    policy: BackoffPolicy,
    attach_timeout: Duration,
    registry: Registry,
    next_generation: AtomicU64,
    runtime: Handle,
}

impl SubscriptionManager {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        events: mpsc::Sender<SyncEvent>,
        policy: BackoffPolicy,
        attach_timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            feed,
            events,
            policy,
            attach_timeout,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            runtime,
        }
    }

    pub fn from_config(
        feed: Arc<dyn ChangeFeed>,
        events: mpsc::Sender<SyncEvent>,
        config: &CoreConfig,
        runtime: Handle,
    ) -> Self {
        Self::new(
            feed,
            events,
            BackoffPolicy::from_config(&config.backoff),
            config.attach_timeout(),
            runtime,
        )
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Idempotently subscribe to `conversation_id`.
    ///
    /// An existing entry is reused; if it is waiting in backoff or failed it
    /// is woken for an immediate reattach.
    pub fn subscribe(&self, conversation_id: &str) -> SubscriptionHandle {
        let mut entries = self.registry.lock();

        if let Some(entry) = entries.get(conversation_id) {
            if matches!(
                entry.snapshot.state,
                SubscriptionState::Backoff | SubscriptionState::Failed
            ) {
                debug!(conversation_id, "subscribe woke a retrying subscription");
                entry.wake.notify_one();
            }
            return SubscriptionHandle {
                conversation_id: conversation_id.to_string(),
                generation: entry.snapshot.generation,
            };
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        let task = SubscriptionTask {
            conversation_id: conversation_id.to_string(),
            generation,
            feed: self.feed.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
            policy: self.policy,
            attach_timeout: self.attach_timeout,
            cancel_rx,
            wake: wake.clone(),
        };

        entries.insert(
            conversation_id.to_string(),
            RegistryEntry {
                snapshot: Subscription {
                    conversation_id: conversation_id.to_string(),
                    state: SubscriptionState::Connecting,
                    resume_cursor: None,
                    attempt: 0,
                    generation,
                },
                cancel_tx,
                wake,
                task: Some(self.runtime.spawn(task.run())),
            },
        );
        info!(conversation_id, generation, "subscription created");

        SubscriptionHandle {
            conversation_id: conversation_id.to_string(),
            generation,
        }
    }

    /// Tear down the subscription of `conversation_id`. No-op when absent.
    pub fn unsubscribe(&self, conversation_id: &str) {
        let removed = self.registry.lock().remove(conversation_id);
        if let Some(entry) = removed {
            Self::cancel(entry);
            info!(conversation_id, "subscription removed");
        }
    }

    /// Tear down every subscription.
    pub fn shutdown(&self) {
        let drained: Vec<RegistryEntry> = {
            let mut entries = self.registry.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            Self::cancel(entry);
        }
    }

    pub fn snapshot(&self, conversation_id: &str) -> Option<Subscription> {
        self.registry
            .lock()
            .get(conversation_id)
            .map(|entry| entry.snapshot.clone())
    }

    /// Snapshots of all subscriptions sorted by conversation id.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> = self
            .registry
            .lock()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        all.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        all
    }

    pub fn connectivity(&self, conversation_id: &str) -> Option<ConnectivityStatus> {
        self.snapshot(conversation_id)
            .map(|snapshot| snapshot.state.connectivity())
    }

    /// Whether events tagged with `generation` still belong to the live entry.
    pub fn is_current(&self, conversation_id: &str, generation: u64) -> bool {
        self.registry
            .lock()
            .get(conversation_id)
            .is_some_and(|entry| entry.snapshot.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancel(mut entry: RegistryEntry) {
        let _ = entry.cancel_tx.send(true);
        if let Some(task) = entry.task.take() {
            task.abort();
        }
    }
}

impl SubscriptionControl for SubscriptionManager {
    fn subscribe(&self, conversation_id: &str) -> SubscriptionHandle {
        SubscriptionManager::subscribe(self, conversation_id)
    }

    fn unsubscribe(&self, conversation_id: &str) {
        SubscriptionManager::unsubscribe(self, conversation_id)
    }
}

impl<T: SubscriptionControl + ?Sized> SubscriptionControl for Arc<T> {
    fn subscribe(&self, conversation_id: &str) -> SubscriptionHandle {
        (**self).subscribe(conversation_id)
    }

    fn unsubscribe(&self, conversation_id: &str) {
        (**self).unsubscribe(conversation_id)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
