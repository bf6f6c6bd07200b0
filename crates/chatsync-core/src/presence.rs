use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::PresenceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

/// Heartbeat-based presence. Advisory only: nothing in delivery or unread
/// accounting consults it.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    last_seen: HashMap<String, Instant>,
    online_window: Duration,
    away_window: Duration,
}

impl PresenceTracker {
    pub fn new(online_window: Duration, away_window: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            online_window,
            away_window: away_window.max(online_window),
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::new(config.online_window(), config.away_window())
    }

    pub fn heartbeat(&mut self, participant_id: &str) {
        self.heartbeat_at(participant_id, Instant::now());
    }

    /// Record a heartbeat at `at`. Out-of-order heartbeats never move
    /// last-seen backwards.
    pub fn heartbeat_at(&mut self, participant_id: &str, at: Instant) {
        self.last_seen
            .entry(participant_id.to_string())
            .and_modify(|seen| *seen = (*seen).max(at))
            .or_insert(at);
    }

    pub fn presence(&self, participant_id: &str) -> Presence {
        self.presence_at(participant_id, Instant::now())
    }

    pub fn presence_at(&self, participant_id: &str, now: Instant) -> Presence {
        match self.last_seen.get(participant_id) {
            Some(seen) => self.classify(now.saturating_duration_since(*seen)),
            None => Presence::Offline,
        }
    }

    pub fn last_seen(&self, participant_id: &str) -> Option<Instant> {
        self.last_seen.get(participant_id).copied()
    }

    pub fn snapshot(&self) -> Vec<(String, Presence)> {
        self.snapshot_at(Instant::now())
    }

    pub fn prune(&mut self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Presence of every participant that ever sent a heartbeat, sorted by id.
    pub fn snapshot_at(&self, now: Instant) -> Vec<(String, Presence)> {
        let mut entries: Vec<_> = self
            .last_seen
            .iter()
            .map(|(id, seen)| (id.clone(), self.classify(now.saturating_duration_since(*seen))))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Forget participants that have been offline for longer than the away
    /// window again (i.e. last seen more than twice the away window ago).
    /// Returns the number of entries removed.
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let horizon = self.away_window.saturating_mul(2);
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < horizon);
        before - self.last_seen.len()
    }

    fn classify(&self, age: Duration) -> Presence {
        if age < self.online_window {
            Presence::Online
        } else if age < self.away_window {
            Presence::Away
        } else {
            Presence::Offline
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::from_config(&PresenceConfig::default())
    }
}
