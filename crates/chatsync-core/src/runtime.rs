use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{SendFailure, SyncError};
use crate::events::{SyncEvent, SyncUpdate};
use crate::feed::Collaborators;
use crate::models::{now_ms, ClientTempId, Conversation, Message};
use crate::presence::{Presence, PresenceTracker};
use crate::reconcile::{ConversationSummary, ReconciliationEngine, SendOutcome};
use crate::subscription::{ConnectivityStatus, Subscription, SubscriptionManager};
use crate::windows::{DockLayout, DockSlot, WindowBadge, WindowManager, WindowMode, WindowTransition};

/// Single-owner sync facade driven by the UI loop.
///
/// Subscription tasks and store I/O report into one bounded queue; the UI
/// awaits [`ChatSync::next_update`] (or calls [`ChatSync::drain`]) which folds
/// queued events into the reconciliation engine. Every other call is
/// synchronous and returns immediately.
pub struct ChatSync {
    config: CoreConfig,
    collaborators: Collaborators,
    self_id: String,
    subscriptions: Arc<SubscriptionManager>,
    engine: ReconciliationEngine,
    windows: WindowManager<Arc<SubscriptionManager>>,
    presence: PresenceTracker,
    /// Last connectivity announced per conversation
    announced: HashMap<String, ConnectivityStatus>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: mpsc::Receiver<SyncEvent>,
    runtime: Handle,
}

impl ChatSync {
    /// Build the runtime. Must be called from within a tokio runtime.
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Result<Self, SyncError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SyncError::NoAsyncRuntime)?;

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
        let subscriptions = Arc::new(SubscriptionManager::from_config(
            collaborators.feed.clone(),
            events_tx.clone(),
            &config,
            runtime.clone(),
        ));
        let self_id = collaborators.session.self_id();
        let windows = WindowManager::from_config(subscriptions.clone(), &config.windows);

        info!(self_id = %self_id, "sync runtime started");
        Ok(Self {
            engine: ReconciliationEngine::new(self_id.clone()),
            presence: PresenceTracker::from_config(&config.presence),
            windows,
            subscriptions,
            announced: HashMap::new(),
            events_tx,
            events_rx,
            runtime,
            self_id,
            collaborators,
            config,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    // ===== Windows =====

    pub fn open(&mut self, conversation_id: &str) -> WindowTransition {
        self.open_conversation(Conversation::new(conversation_id))
    }

    /// Open a window for `conversation`. A conversation that is not yet
    /// tracked gets its recent history fetched.
    pub fn open_conversation(&mut self, conversation: Conversation) -> WindowTransition {
        let conversation_id = conversation.id.clone();
        if self.engine.track(conversation) {
            self.spawn_history_fetch(&conversation_id);
        }
        let transition = self.windows.open(&conversation_id);
        self.forget_evicted(&transition);
        transition
    }

    pub fn minimize(&mut self, conversation_id: &str) -> WindowTransition {
        let transition = self.windows.minimize(conversation_id);
        self.forget_evicted(&transition);
        transition
    }

    /// Close the window, cancel its subscription and drop its timeline.
    pub fn close(&mut self, conversation_id: &str) -> bool {
        let closed = self.windows.close(conversation_id);
        self.forget(conversation_id);
        closed
    }

    pub fn focus(&mut self, conversation_id: &str) -> bool {
        self.windows.focus(conversation_id)
    }

    pub fn rearrange_all(&mut self, layout: DockLayout) -> Vec<DockSlot> {
        self.windows.rearrange_all(layout)
    }

    pub fn window_mode(&self, conversation_id: &str) -> WindowMode {
        self.windows.mode(conversation_id)
    }

    pub fn maximized(&self) -> Vec<String> {
        self.windows.maximized()
    }

    pub fn minimized(&self) -> Vec<String> {
        self.windows.minimized()
    }

    pub fn badges(&self) -> Vec<WindowBadge> {
        self.windows.badges(&self.engine)
    }

    // ===== Messages =====

    /// Append an optimistic message and start the store write. Returns the
    /// temp id immediately.
    pub fn send(&mut self, conversation_id: &str, content: &str) -> Result<ClientTempId, SyncError> {
        let client_temp_id = self.engine.send(conversation_id, content, now_ms())?;
        self.spawn_write(conversation_id, content.to_string(), client_temp_id.clone());
        Ok(client_temp_id)
    }

    /// Explicit user retry of a failed send under the same temp id.
    pub fn retry_send(
        &mut self,
        conversation_id: &str,
        client_temp_id: &ClientTempId,
    ) -> Result<(), SyncError> {
        let content = self
            .engine
            .retry_send(conversation_id, client_temp_id, now_ms())?;
        self.spawn_write(conversation_id, content, client_temp_id.clone());
        Ok(())
    }

    pub fn discard_failed(
        &mut self,
        conversation_id: &str,
        client_temp_id: &ClientTempId,
    ) -> Result<Message, SyncError> {
        self.engine.discard_failed(conversation_id, client_temp_id)
    }

    /// Zero the unread count locally and persist the read marker.
    pub fn mark_read(&mut self, conversation_id: &str) -> Result<u64, SyncError> {
        let marker = self.engine.mark_read(conversation_id, now_ms())?;

        let store = self.collaborators.store.clone();
        let conversation_id = conversation_id.to_string();
        let participant_id = self.self_id.clone();
        self.runtime.spawn(async move {
            if let Err(err) = store.mark_read(&conversation_id, &participant_id, marker).await {
                warn!(
                    conversation_id = %conversation_id,
                    code = err.code(),
                    error = %err,
                    "failed to persist read marker"
                );
            }
        });
        Ok(marker)
    }

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.engine.messages(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        self.engine.unread_count(conversation_id)
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.engine.conversations()
    }

    // ===== Connectivity & presence =====

    pub fn connectivity(&self, conversation_id: &str) -> Option<ConnectivityStatus> {
        self.subscriptions.connectivity(conversation_id)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.subscriptions()
    }

    pub fn heartbeat(&mut self, participant_id: &str) {
        self.presence.heartbeat(participant_id);
    }

    pub fn presence(&self, participant_id: &str) -> Presence {
        self.presence.presence(participant_id)
    }

    pub fn presence_tracker(&mut self) -> &mut PresenceTracker {
        &mut self.presence
    }

    // ===== Event folding =====

    /// Wait for the next queued event that changes visible state.
    pub async fn next_update(&mut self) -> Option<SyncUpdate> {
        loop {
            let event = self.events_rx.recv().await?;
            if let Some(update) = self.apply(event) {
                return Some(update);
            }
        }
    }

    /// Fold everything already queued without waiting.
    pub fn drain(&mut self) -> Vec<SyncUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(update) = self.apply(event) {
                updates.push(update);
            }
        }
        updates
    }

    /// Close every window and stop all subscription tasks.
    pub fn shutdown(&mut self) {
        for id in self.windows.close_all() {
            self.engine.forget(&id);
        }
        self.subscriptions.shutdown();
        self.announced.clear();
        info!("sync runtime stopped");
    }

    fn apply(&mut self, event: SyncEvent) -> Option<SyncUpdate> {
        match event {
            SyncEvent::Feed { generation, event } => {
                let conversation_id = event.conversation_id().to_string();
                if !self.subscriptions.is_current(&conversation_id, generation) {
                    debug!(conversation_id = %conversation_id, generation, "dropping event from stale subscription");
                    return None;
                }
                self.engine
                    .on_feed_event(event)
                    .then_some(SyncUpdate::MessagesChanged { conversation_id })
            }
            SyncEvent::Status {
                conversation_id,
                generation,
                state,
                attempt,
            } => {
                if !self.subscriptions.is_current(&conversation_id, generation) {
                    return None;
                }
                let status = state.connectivity();
                if self.announced.get(&conversation_id) == Some(&status) {
                    return None;
                }
                debug!(conversation_id = %conversation_id, ?state, attempt, "connectivity changed");
                self.announced.insert(conversation_id.clone(), status);
                Some(SyncUpdate::ConnectivityChanged {
                    conversation_id,
                    status,
                })
            }
            SyncEvent::ResyncRequested {
                conversation_id,
                generation,
            } => {
                if self.subscriptions.is_current(&conversation_id, generation) {
                    info!(conversation_id = %conversation_id, "feed cannot resume, refetching history");
                    self.spawn_history_fetch(&conversation_id);
                }
                None
            }
            SyncEvent::SendCompleted {
                conversation_id,
                client_temp_id,
                result,
            } => match self
                .engine
                .on_send_result(&conversation_id, &client_temp_id, result)
            {
                SendOutcome::Confirmed => Some(SyncUpdate::MessagesChanged { conversation_id }),
                SendOutcome::Failed(failure) => {
                    warn!(
                        conversation_id = %conversation_id,
                        client_temp_id = %client_temp_id,
                        code = failure.code(),
                        error = %failure,
                        "send failed"
                    );
                    Some(SyncUpdate::SendFailed {
                        conversation_id,
                        client_temp_id,
                        failure,
                    })
                }
                SendOutcome::AwaitingEcho | SendOutcome::Ignored => None,
            },
            SyncEvent::History {
                conversation_id,
                messages,
            } => {
                let applied = self.engine.merge_history(&conversation_id, messages);
                (applied > 0).then_some(SyncUpdate::MessagesChanged { conversation_id })
            }
        }
    }

    // ===== Background work =====

    fn spawn_write(&self, conversation_id: &str, content: String, client_temp_id: ClientTempId) {
        let store = self.collaborators.store.clone();
        let events = self.events_tx.clone();
        let send_timeout = self.config.send_timeout();
        let conversation_id = conversation_id.to_string();

        self.runtime.spawn(async move {
            let write = store.create_message(&conversation_id, &content, &client_temp_id);
            let result = match tokio::time::timeout(send_timeout, write).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(err)) => Err(SendFailure::from(err)),
                Err(_) => Err(SendFailure::Timeout(send_timeout.as_millis() as u64)),
            };
            let _ = events
                .send(SyncEvent::SendCompleted {
                    conversation_id,
                    client_temp_id,
                    result,
                })
                .await;
        });
    }

    fn spawn_history_fetch(&self, conversation_id: &str) {
        let store = self.collaborators.store.clone();
        let events = self.events_tx.clone();
        let limit = self.config.history_limit;
        let conversation_id = conversation_id.to_string();

        self.runtime.spawn(async move {
            match store.fetch_recent(&conversation_id, limit).await {
                Ok(messages) => {
                    let _ = events
                        .send(SyncEvent::History {
                            conversation_id,
                            messages,
                        })
                        .await;
                }
                Err(err) => {
                    warn!(
                        conversation_id = %conversation_id,
                        code = err.code(),
                        error = %err,
                        "history fetch failed"
                    );
                }
            }
        });
    }

    fn forget_evicted(&mut self, transition: &WindowTransition) {
        for id in &transition.evicted {
            self.forget(id);
        }
    }

    fn forget(&mut self, conversation_id: &str) {
        self.engine.forget(conversation_id);
        self.announced.remove(conversation_id);
    }
}

impl Drop for ChatSync {
    fn drop(&mut self) {
        self.subscriptions.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::{AckMode, InMemoryBackend, InMemoryChangeFeed};
    use std::time::Duration;

    fn runtime(backend: &InMemoryBackend) -> ChatSync {
        ChatSync::new(CoreConfig::default(), backend.collaborators()).unwrap()
    }

    /// Fold updates until `done` holds.
    async fn pump_until(sync: &mut ChatSync, done: impl Fn(&ChatSync) -> bool) -> Vec<SyncUpdate> {
        let mut seen = Vec::new();
        while !done(&*sync) {
            let update = tokio::time::timeout(Duration::from_secs(120), sync.next_update())
                .await
                .expect("no update before timeout")
                .expect("event queue closed");
            seen.push(update);
        }
        seen
    }

    fn is_live(conversation_id: &'static str) -> impl Fn(&ChatSync) -> bool {
        move |sync| {
            sync.announced.get(conversation_id) == Some(&ConnectivityStatus::Live)
        }
    }

    #[test]
    fn test_new_requires_tokio_runtime() {
        let backend = InMemoryBackend::new("me");
        let err = ChatSync::new(CoreConfig::default(), backend.collaborators())
            .err()
            .unwrap();
        assert_eq!(err.code(), "no_async_runtime");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_send_confirmed_by_echo() {
        let backend = InMemoryBackend::new("me");
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        let temp = sync.send("c1", "hello").unwrap();
        assert!(sync.messages("c1")[0].is_pending());

        pump_until(&mut sync, |s| s.messages("c1")[0].is_confirmed()).await;
        let messages = sync.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].client_temp_id, temp);
        assert_eq!(messages[0].server_id.as_ref().map(|id| id.as_str()), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_fails_until_retried() {
        let backend = InMemoryBackend::new("me");
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.store.set_reject(Some(StoreError::Rejected("too long".into())));
        let temp = sync.send("c1", "hello").unwrap();
        let updates = pump_until(&mut sync, |s| s.messages("c1")[0].is_failed()).await;
        assert!(updates.contains(&SyncUpdate::SendFailed {
            conversation_id: "c1".into(),
            client_temp_id: temp.clone(),
            failure: SendFailure::Rejected("too long".into()),
        }));

        backend.store.set_reject(None);
        sync.retry_send("c1", &temp).unwrap();
        pump_until(&mut sync, |s| s.messages("c1")[0].is_confirmed()).await;
        assert_eq!(sync.messages("c1").len(), 1);
        assert_eq!(backend.store.messages("c1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_write_times_out() {
        let backend = InMemoryBackend::new("me");
        let config = CoreConfig {
            send_timeout_ms: 200,
            ..CoreConfig::default()
        };
        let mut sync = ChatSync::new(config, backend.collaborators()).unwrap();
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.store.set_hang_writes(true);
        sync.send("c1", "hello").unwrap();
        pump_until(&mut sync, |s| s.messages("c1")[0].is_failed()).await;
        assert_eq!(
            sync.messages("c1")[0].failure,
            Some(SendFailure::Timeout(200))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_messages_sent_during_outage() {
        let backend = InMemoryBackend::new("me");
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.store.insert_remote("c1", "bob", "before");
        pump_until(&mut sync, |s| s.messages("c1").len() == 1).await;

        backend.feed.disconnect("c1");
        backend.store.insert_remote("c1", "bob", "during");
        let updates = pump_until(&mut sync, |s| s.messages("c1").len() == 2).await;

        assert!(updates.contains(&SyncUpdate::ConnectivityChanged {
            conversation_id: "c1".into(),
            status: ConnectivityStatus::Reconnecting,
        }));
        let contents: Vec<&str> = sync.messages("c1").iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["before", "during"]);
        assert_eq!(sync.unread_count("c1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_without_resume_refetches_history() {
        let backend =
            InMemoryBackend::with_feed("me", InMemoryChangeFeed::without_resume(), AckMode::EchoOnly);
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.feed.disconnect("c1");
        backend.store.insert_remote("c1", "bob", "missed");
        pump_until(&mut sync, |s| s.messages("c1").len() == 1).await;
        assert_eq!(sync.messages("c1")[0].content, "missed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_loads_history() {
        let backend = InMemoryBackend::new("me");
        backend.store.insert_remote("c1", "bob", "old news");
        let mut sync = runtime(&backend);

        sync.open("c1");
        pump_until(&mut sync, |s| s.messages("c1").len() == 1).await;
        assert_eq!(sync.conversations()[0].unread, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_zeroes_unread_and_persists() {
        let backend = InMemoryBackend::new("me");
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.store.insert_remote("c1", "bob", "ping");
        pump_until(&mut sync, |s| s.unread_count("c1") == 1).await;

        let marker = sync.mark_read("c1").unwrap();
        assert_eq!(sync.unread_count("c1"), 0);
        assert_eq!(sync.badges()[0].unread, 0);

        for _ in 0..10 {
            if !backend.store.read_marks().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            backend.store.read_marks(),
            vec![("c1".to_string(), "me".to_string(), marker)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_capacity_drives_subscriptions() {
        let backend = InMemoryBackend::new("me");
        let mut config = CoreConfig::default();
        config.windows.max_open_windows = 3;
        config.windows.max_minimized_windows = 1;
        let mut sync = ChatSync::new(config, backend.collaborators()).unwrap();

        for id in ["A", "B", "C", "D"] {
            sync.open(id);
        }
        assert_eq!(sync.maximized(), vec!["D", "C", "B"]);
        assert_eq!(sync.minimized(), vec!["A"]);
        assert_eq!(sync.subscriptions().len(), 4);

        let transition = sync.open("E");
        assert_eq!(transition.demoted, vec!["B"]);
        assert_eq!(transition.evicted, vec!["A"]);
        assert_eq!(sync.window_mode("A"), WindowMode::Closed);
        assert!(sync.connectivity("A").is_none());
        assert_eq!(sync.subscriptions().len(), 4);
        assert!(sync.send("A", "hi").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_state_and_late_results() {
        let backend = InMemoryBackend::new("me");
        let mut sync = runtime(&backend);
        sync.open("c1");
        pump_until(&mut sync, is_live("c1")).await;

        backend.store.set_hang_writes(true);
        sync.send("c1", "never mind").unwrap();
        assert!(sync.close("c1"));
        assert!(!sync.close("c1"));

        assert!(sync.messages("c1").is_empty());
        assert!(sync.subscriptions().is_empty());
        assert!(sync.conversations().is_empty());
        assert!(sync.drain().is_empty());
    }
}
