use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WindowConfig;
use crate::reconcile::ReconciliationEngine;
use crate::subscription::SubscriptionControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    Closed,
    Minimized,
    Maximized,
}

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    mode: WindowMode,
    /// Logical focus time; higher is more recent
    last_focused: u64,
    /// Dock order among minimized windows
    minimized_seq: u64,
}

/// Side effects of a window operation on other windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowTransition {
    /// Maximized windows pushed down to minimized (still subscribed)
    pub demoted: Vec<String>,
    /// Minimized windows pushed out to closed (unsubscribed)
    pub evicted: Vec<String>,
}

impl WindowTransition {
    pub fn is_empty(&self) -> bool {
        self.demoted.is_empty() && self.evicted.is_empty()
    }
}

/// Geometry of the minimized dock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockLayout {
    pub slot_width: u32,
    pub gap: u32,
}

impl Default for DockLayout {
    fn default() -> Self {
        Self {
            slot_width: 240,
            gap: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockSlot {
    pub conversation_id: String,
    pub index: usize,
    /// Offset from the dock origin
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBadge {
    pub conversation_id: String,
    pub mode: WindowMode,
    pub unread: usize,
}

/// Chat windows keyed by conversation id. Each id is in exactly one mode;
/// closed windows are simply absent. Opening subscribes, closing (or
/// eviction) unsubscribes.
pub struct WindowManager<C: SubscriptionControl> {
    control: C,
    windows: HashMap<String, WindowSlot>,
    max_open_windows: usize,
    max_minimized_windows: usize,
    focus_clock: u64,
    dock_clock: u64,
}

impl<C: SubscriptionControl> WindowManager<C> {
    pub fn new(control: C, max_open_windows: usize, max_minimized_windows: usize) -> Self {
        Self {
            control,
            windows: HashMap::new(),
            max_open_windows: max_open_windows.max(1),
            max_minimized_windows: max_minimized_windows.max(1),
            focus_clock: 0,
            dock_clock: 0,
        }
    }

    pub fn from_config(control: C, config: &WindowConfig) -> Self {
        Self::new(control, config.max_open_windows, config.max_minimized_windows)
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    // ===== Getters =====

    pub fn mode(&self, conversation_id: &str) -> WindowMode {
        self.windows
            .get(conversation_id)
            .map(|slot| slot.mode)
            .unwrap_or(WindowMode::Closed)
    }

    /// Maximized windows, most recently focused first.
    pub fn maximized(&self) -> Vec<String> {
        let mut open: Vec<(&String, &WindowSlot)> = self
            .windows
            .iter()
            .filter(|(_, slot)| slot.mode == WindowMode::Maximized)
            .collect();
        open.sort_by(|a, b| b.1.last_focused.cmp(&a.1.last_focused));
        open.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Minimized windows in dock order.
    pub fn minimized(&self) -> Vec<String> {
        let mut docked: Vec<(&String, &WindowSlot)> = self
            .windows
            .iter()
            .filter(|(_, slot)| slot.mode == WindowMode::Minimized)
            .collect();
        docked.sort_by_key(|(_, slot)| slot.minimized_seq);
        docked.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Unread badge per open window, maximized first.
    pub fn badges(&self, engine: &ReconciliationEngine) -> Vec<WindowBadge> {
        self.maximized()
            .into_iter()
            .chain(self.minimized())
            .map(|id| WindowBadge {
                mode: self.mode(&id),
                unread: engine.unread_count(&id),
                conversation_id: id,
            })
            .collect()
    }

    // ===== Transitions =====

    /// Open or bring forward the window of `conversation_id`.
    pub fn open(&mut self, conversation_id: &str) -> WindowTransition {
        let focus = self.next_focus();
        match self.windows.get_mut(conversation_id) {
            Some(slot) if slot.mode == WindowMode::Maximized => {
                slot.last_focused = focus;
                return WindowTransition::default();
            }
            Some(slot) => {
                slot.mode = WindowMode::Maximized;
                slot.last_focused = focus;
                debug!(conversation_id, "window restored");
            }
            None => {
                self.windows.insert(
                    conversation_id.to_string(),
                    WindowSlot {
                        mode: WindowMode::Maximized,
                        last_focused: focus,
                        minimized_seq: 0,
                    },
                );
                self.control.subscribe(conversation_id);
                info!(conversation_id, "window opened");
            }
        }
        self.enforce_capacity(conversation_id)
    }

    /// Maximized → minimized. Other modes are left alone.
    pub fn minimize(&mut self, conversation_id: &str) -> WindowTransition {
        let seq = self.next_dock_seq();
        match self.windows.get_mut(conversation_id) {
            Some(slot) if slot.mode == WindowMode::Maximized => {
                slot.mode = WindowMode::Minimized;
                slot.minimized_seq = seq;
                debug!(conversation_id, "window minimized");
            }
            _ => return WindowTransition::default(),
        }
        self.enforce_capacity(conversation_id)
    }

    /// Close the window and tear down its subscription. Returns false when
    /// it was already closed.
    pub fn close(&mut self, conversation_id: &str) -> bool {
        if self.windows.remove(conversation_id).is_none() {
            return false;
        }
        self.control.unsubscribe(conversation_id);
        info!(conversation_id, "window closed");
        true
    }

    /// Close every window; returns the closed ids.
    pub fn close_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.windows.keys().cloned().collect();
        for id in &ids {
            self.close(id);
        }
        ids
    }

    /// Mark an open window as most recently focused without changing its mode.
    pub fn focus(&mut self, conversation_id: &str) -> bool {
        let focus = self.next_focus();
        match self.windows.get_mut(conversation_id) {
            Some(slot) => {
                slot.last_focused = focus;
                true
            }
            None => false,
        }
    }

    /// Lay out the minimized dock left to right in minimize order and
    /// compact the order. No subscription effects.
    pub fn rearrange_all(&mut self, layout: DockLayout) -> Vec<DockSlot> {
        let order = self.minimized();
        let stride = layout.slot_width.saturating_add(layout.gap);
        let mut slots = Vec::with_capacity(order.len());
        for (index, id) in order.into_iter().enumerate() {
            if let Some(slot) = self.windows.get_mut(&id) {
                slot.minimized_seq = index as u64;
            }
            slots.push(DockSlot {
                conversation_id: id,
                index,
                offset: stride.saturating_mul(index as u32),
            });
        }
        self.dock_clock = slots.len() as u64;
        slots
    }

    // ===== Internals =====

    fn next_focus(&mut self) -> u64 {
        self.focus_clock += 1;
        self.focus_clock
    }

    fn next_dock_seq(&mut self) -> u64 {
        self.dock_clock += 1;
        self.dock_clock
    }

    /// Demote overflowing maximized windows, then evict overflowing minimized
    /// ones. `keep` is never demoted or evicted.
    fn enforce_capacity(&mut self, keep: &str) -> WindowTransition {
        let mut transition = WindowTransition::default();

        while self.count(WindowMode::Maximized) > self.max_open_windows {
            let Some(victim) = self.least_recent(WindowMode::Maximized, Some(keep)) else {
                break;
            };
            let seq = self.next_dock_seq();
            if let Some(slot) = self.windows.get_mut(&victim) {
                slot.mode = WindowMode::Minimized;
                slot.minimized_seq = seq;
            }
            debug!(conversation_id = %victim, "window demoted to minimized");
            transition.demoted.push(victim);
        }

        while self.count(WindowMode::Minimized) > self.max_minimized_windows {
            let Some(victim) = self.least_recent(WindowMode::Minimized, Some(keep)) else {
                break;
            };
            self.windows.remove(&victim);
            self.control.unsubscribe(&victim);
            info!(conversation_id = %victim, "minimized window evicted");
            transition.evicted.push(victim);
        }

        transition
    }

    fn count(&self, mode: WindowMode) -> usize {
        self.windows.values().filter(|slot| slot.mode == mode).count()
    }

    fn least_recent(&self, mode: WindowMode, skip: Option<&str>) -> Option<String> {
        self.windows
            .iter()
            .filter(|(id, slot)| slot.mode == mode && Some(id.as_str()) != skip)
            .min_by_key(|(_, slot)| slot.last_focused)
            .map(|(id, _)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionHandle;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingControl {
        calls: RefCell<Vec<String>>,
    }

    impl RecordingControl {
        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl SubscriptionControl for RecordingControl {
        fn subscribe(&self, conversation_id: &str) -> SubscriptionHandle {
            self.calls.borrow_mut().push(format!("+{conversation_id}"));
            SubscriptionHandle {
                conversation_id: conversation_id.to_string(),
                generation: 1,
            }
        }

        fn unsubscribe(&self, conversation_id: &str) {
            self.calls.borrow_mut().push(format!("-{conversation_id}"));
        }
    }

    fn assert_partitioned(windows: &WindowManager<RecordingControl>) {
        let maximized = windows.maximized();
        let minimized = windows.minimized();
        assert_eq!(maximized.len() + minimized.len(), windows.len());
        for id in &maximized {
            assert!(!minimized.contains(id), "{id} in both sets");
            assert_eq!(windows.mode(id), WindowMode::Maximized);
        }
        for id in &minimized {
            assert_eq!(windows.mode(id), WindowMode::Minimized);
        }
    }

    #[test]
    fn test_open_subscribes_once() {
        let mut windows = WindowManager::new(RecordingControl::default(), 3, 8);
        windows.open("c1");
        windows.open("c1");
        assert_eq!(windows.control().calls(), vec!["+c1"]);
        assert_eq!(windows.mode("c1"), WindowMode::Maximized);
        assert_eq!(windows.mode("other"), WindowMode::Closed);
    }

    #[test]
    fn test_overflow_demotes_least_recently_focused() {
        let mut windows = WindowManager::new(RecordingControl::default(), 3, 8);
        for id in ["A", "B", "C", "D", "E"] {
            windows.open(id);
            assert_partitioned(&windows);
        }

        assert_eq!(windows.maximized(), vec!["E", "D", "C"]);
        assert_eq!(windows.minimized(), vec!["A", "B"]);
        assert_eq!(
            windows.control().calls(),
            vec!["+A", "+B", "+C", "+D", "+E"]
        );
    }

    #[test]
    fn test_focus_protects_window_from_demotion() {
        let mut windows = WindowManager::new(RecordingControl::default(), 2, 8);
        windows.open("A");
        windows.open("B");
        windows.focus("A");
        let transition = windows.open("C");
        assert_eq!(transition.demoted, vec!["B"]);
        assert!(transition.evicted.is_empty());
    }

    #[test]
    fn test_reopening_minimized_window_promotes_it() {
        let mut windows = WindowManager::new(RecordingControl::default(), 2, 8);
        windows.open("A");
        windows.open("B");
        windows.minimize("A");
        assert_eq!(windows.mode("A"), WindowMode::Minimized);

        let transition = windows.open("A");
        assert!(transition.is_empty());
        assert_eq!(windows.mode("A"), WindowMode::Maximized);
        // No second subscribe for a window that never closed
        assert_eq!(windows.control().calls(), vec!["+A", "+B"]);
    }

    #[test]
    fn test_minimized_overflow_evicts_to_closed() {
        let mut windows = WindowManager::new(RecordingControl::default(), 1, 2);
        windows.open("A");
        windows.open("B");
        windows.open("C");
        let transition = windows.open("D");

        assert_eq!(transition.demoted, vec!["C"]);
        assert_eq!(transition.evicted, vec!["A"]);
        assert_eq!(windows.mode("A"), WindowMode::Closed);
        assert_eq!(windows.minimized(), vec!["B", "C"]);
        assert!(windows.control().calls().contains(&"-A".to_string()));
        assert_partitioned(&windows);
    }

    #[test]
    fn test_minimize_never_evicts_the_window_itself() {
        let mut windows = WindowManager::new(RecordingControl::default(), 3, 1);
        windows.open("A");
        windows.open("B");
        windows.minimize("B");
        windows.focus("B");

        let transition = windows.minimize("A");
        assert_eq!(transition.evicted, vec!["B"]);
        assert_eq!(windows.mode("A"), WindowMode::Minimized);
        assert_eq!(windows.control().calls(), vec!["+A", "+B", "-B"]);
        assert_partitioned(&windows);
    }

    #[test]
    fn test_zero_minimized_capacity_keeps_one_dock_slot() {
        let mut windows = WindowManager::new(RecordingControl::default(), 3, 0);
        windows.open("A");
        assert!(windows.minimize("A").is_empty());
        assert_eq!(windows.mode("A"), WindowMode::Minimized);
    }

    #[test]
    fn test_close_unsubscribes_and_is_idempotent() {
        let mut windows = WindowManager::new(RecordingControl::default(), 3, 8);
        windows.open("A");
        windows.minimize("A");
        assert!(windows.close("A"));
        assert!(!windows.close("A"));
        assert!(windows.is_empty());
        assert_eq!(windows.control().calls(), vec!["+A", "-A"]);

        // Minimizing a closed window is a no-op
        assert!(windows.minimize("A").is_empty());
        assert_eq!(windows.mode("A"), WindowMode::Closed);
    }

    #[test]
    fn test_rearrange_compacts_dock_without_subscription_effects() {
        let mut windows = WindowManager::new(RecordingControl::default(), 4, 8);
        for id in ["A", "B", "C", "D"] {
            windows.open(id);
        }
        windows.minimize("C");
        windows.minimize("A");
        windows.minimize("D");
        windows.close("A");
        let before = windows.control().calls();

        let slots = windows.rearrange_all(DockLayout { slot_width: 100, gap: 10 });
        let ids: Vec<&str> = slots.iter().map(|s| s.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "D"]);
        assert_eq!(slots[1].offset, 110);
        assert_eq!(windows.control().calls(), before);

        windows.minimize("B");
        assert_eq!(windows.minimized(), vec!["C", "D", "B"]);
    }

    #[test]
    fn test_badges_follow_unread_counts() {
        use crate::models::{Conversation, FeedEvent, FeedMessage, ServerId};

        let mut engine = ReconciliationEngine::new("me");
        engine.track(Conversation::new("A"));
        engine.track(Conversation::new("B"));
        engine.on_feed_event(FeedEvent::insert(FeedMessage {
            server_id: ServerId::from("1"),
            client_temp_id: None,
            conversation_id: "B".into(),
            sender_id: "bob".into(),
            content: "ping".into(),
            created_at: 10,
        }));

        let mut windows = WindowManager::new(RecordingControl::default(), 3, 8);
        windows.open("A");
        windows.open("B");
        windows.minimize("B");

        let badges = windows.badges(&engine);
        assert_eq!(
            badges,
            vec![
                WindowBadge { conversation_id: "A".into(), mode: WindowMode::Maximized, unread: 0 },
                WindowBadge { conversation_id: "B".into(), mode: WindowMode::Minimized, unread: 1 },
            ]
        );
    }
}
