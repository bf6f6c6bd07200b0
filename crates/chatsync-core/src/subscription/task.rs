use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use super::{update_entry, BackoffPolicy, Registry, SubscriptionState};
use crate::error::TransportError;
use crate::events::SyncEvent;
use crate::feed::{ChangeFeed, FeedStream};
use crate::models::{now_ms, FeedEvent};

enum PumpExit {
    Cancelled,
    /// The consumer dropped the queue or the entry was replaced.
    Orphaned,
    Disconnected(TransportError),
}

/// Attach/pump/backoff loop behind one registry entry.
pub(super) struct SubscriptionTask {
    pub(super) conversation_id: String,
    pub(super) generation: u64,
    pub(super) feed: Arc<dyn ChangeFeed>,
    pub(super) events: mpsc::Sender<SyncEvent>,
    pub(super) registry: Registry,
    pub(super) policy: BackoffPolicy,
    pub(super) attach_timeout: Duration,
    pub(super) cancel_rx: watch::Receiver<bool>,
    pub(super) wake: Arc<Notify>,
}

impl SubscriptionTask {
    pub(super) async fn run(mut self) {
        let mut cursor: Option<u64> = None;
        let mut attempt: u32 = 0;
        let mut attached_before = false;

        loop {
            if *self.cancel_rx.borrow() {
                break;
            }
            if !self.publish_state(SubscriptionState::Connecting, attempt).await {
                break;
            }

            let attach = tokio::time::timeout(
                self.attach_timeout,
                self.feed.attach(&self.conversation_id, cursor),
            );
            let outcome = tokio::select! {
                _ = self.cancel_rx.changed() => break,
                result = attach => match result {
                    Ok(attached) => attached,
                    Err(_) => Err(TransportError::Timeout(self.attach_timeout)),
                },
            };

            match outcome {
                Ok(stream) => {
                    attempt = 0;
                    if cursor.is_none() {
                        let now = now_ms();
                        cursor = Some(now);
                        update_entry(&self.registry, &self.conversation_id, self.generation, |s| {
                            s.resume_cursor = Some(now)
                        });
                    }
                    if !self.publish_state(SubscriptionState::Live, 0).await {
                        break;
                    }
                    info!(
                        conversation_id = %self.conversation_id,
                        since = ?cursor,
                        "subscription live"
                    );

                    if attached_before && !self.feed.supports_resume() {
                        let resync = SyncEvent::ResyncRequested {
                            conversation_id: self.conversation_id.clone(),
                            generation: self.generation,
                        };
                        if self.events.send(resync).await.is_err() {
                            break;
                        }
                    }
                    attached_before = true;

                    match self.pump(stream, &mut cursor).await {
                        PumpExit::Cancelled | PumpExit::Orphaned => break,
                        PumpExit::Disconnected(err) => {
                            info!(
                                conversation_id = %self.conversation_id,
                                code = err.code(),
                                error = %err,
                                "feed dropped, scheduling resubscribe"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        attempt,
                        code = err.code(),
                        error = %err,
                        "feed attach failed"
                    );
                }
            }

            let delay = self.policy.delay_for_attempt(attempt, rand::random::<f64>());
            attempt = attempt.saturating_add(1);
            let state = if self.policy.is_exhausted(attempt) {
                SubscriptionState::Failed
            } else {
                SubscriptionState::Backoff
            };
            if !self.publish_state(state, attempt).await {
                break;
            }
            debug!(
                conversation_id = %self.conversation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "waiting before resubscribe"
            );

            tokio::select! {
                _ = self.cancel_rx.changed() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(conversation_id = %self.conversation_id, generation = self.generation, "subscription task stopped");
    }

    /// Forward feed items until the stream ends, errors, or the task is cancelled.
    async fn pump(&mut self, mut stream: FeedStream, cursor: &mut Option<u64>) -> PumpExit {
        loop {
            let item = tokio::select! {
                _ = self.cancel_rx.changed() => return PumpExit::Cancelled,
                item = stream.next() => item,
            };

            let raw = match item {
                Some(Ok(raw)) => raw,
                Some(Err(err)) => return PumpExit::Disconnected(err),
                None => {
                    return PumpExit::Disconnected(TransportError::Disconnected(
                        "stream ended".into(),
                    ))
                }
            };

            let event = match FeedEvent::from_value(raw, &self.conversation_id) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        code = err.code(),
                        error = %err,
                        "dropping malformed feed event"
                    );
                    continue;
                }
            };

            let committed_at = event.committed_at;
            let queued = SyncEvent::Feed {
                generation: self.generation,
                event,
            };
            if self.events.send(queued).await.is_err() {
                return PumpExit::Orphaned;
            }

            let next = cursor.map_or(committed_at, |c| c.max(committed_at));
            *cursor = Some(next);
            if !update_entry(&self.registry, &self.conversation_id, self.generation, |s| {
                s.resume_cursor = Some(next)
            }) {
                return PumpExit::Orphaned;
            }
        }
    }

    /// Record `state` in the registry and announce it on the queue. Returns
    /// false when this task no longer owns the entry or nobody is listening.
    async fn publish_state(&self, state: SubscriptionState, attempt: u32) -> bool {
        let owned = update_entry(&self.registry, &self.conversation_id, self.generation, |s| {
            s.state = state;
            s.attempt = attempt;
        });
        if !owned {
            return false;
        }

        let status = SyncEvent::Status {
            conversation_id: self.conversation_id.clone(),
            generation: self.generation,
            state,
            attempt,
        };
        if self.events.send(status).await.is_err() {
            update_entry(&self.registry, &self.conversation_id, self.generation, |s| {
                s.state = SubscriptionState::Idle
            });
            return false;
        }
        true
    }
}
