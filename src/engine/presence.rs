use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::bus::EventBus;
use super::events::{OutpostId, PresenceUpdate};

/// In-memory presence for a single outpost.
#[derive(Debug, Default)]
struct OutpostPresence {
    /// Local viewers whose viewport currently shows this outpost's card.
    viewers: HashSet<String>,
    /// Members seen through `user_joined` / `user_left`.
    members: HashSet<String>,
    /// Last server-reported online count. The only displayed number.
    online_count: u32,
}

impl OutpostPresence {
    fn is_live(&self) -> bool {
        !self.members.is_empty() || self.online_count > 0
    }

    fn view(&self, outpost_id: &str) -> PresenceUpdate {
        PresenceUpdate {
            outpost_id: outpost_id.to_string(),
            online_count: self.online_count,
            live: self.is_live(),
        }
    }
}

/// Who is online in which outpost.
///
/// Server snapshots replace the displayed count wholesale, so reordered or
/// duplicated snapshots converge. Local visibility only records this
/// client's own contribution and is never added to the displayed count.
pub struct PresenceTracker {
    outposts: DashMap<OutpostId, OutpostPresence>,
    updates: EventBus<PresenceUpdate>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            outposts: DashMap::new(),
            updates: EventBus::new(),
        }
    }

    /// Record that `viewer`'s viewport shows (or stopped showing) an outpost.
    /// Returns true if the set changed.
    pub fn set_local_visibility(&self, outpost_id: &str, viewer: &str, visible: bool) -> bool {
        if visible {
            self.outposts
                .entry(outpost_id.to_string())
                .or_default()
                .viewers
                .insert(viewer.to_string())
        } else {
            self.outposts
                .get_mut(outpost_id)
                .map(|mut p| p.viewers.remove(viewer))
                .unwrap_or(false)
        }
    }

    /// Replace the displayed online count for an outpost.
    pub fn apply_presence_snapshot(&self, outpost_id: &str, online_count: u32) {
        self.mutate(outpost_id, |p| p.online_count = online_count);
    }

    pub fn member_joined(&self, outpost_id: &str, address: &str) {
        self.mutate(outpost_id, |p| {
            p.members.insert(address.to_string());
        });
    }

    pub fn member_left(&self, outpost_id: &str, address: &str) {
        self.mutate(outpost_id, |p| {
            p.members.remove(address);
        });
    }

    /// Drop the membership we learned while joined; counts and local
    /// visibility survive because they are not tied to a session.
    pub fn forget_members(&self, outpost_id: &str) {
        self.mutate(outpost_id, |p| p.members.clear());
    }

    pub fn online_count(&self, outpost_id: &str) -> u32 {
        self.outposts
            .get(outpost_id)
            .map(|p| p.online_count)
            .unwrap_or(0)
    }

    pub fn is_live(&self, outpost_id: &str) -> bool {
        self.outposts
            .get(outpost_id)
            .map(|p| p.is_live())
            .unwrap_or(false)
    }

    pub fn members(&self, outpost_id: &str) -> Vec<String> {
        self.outposts
            .get(outpost_id)
            .map(|p| p.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_visible(&self, outpost_id: &str, viewer: &str) -> bool {
        self.outposts
            .get(outpost_id)
            .map(|p| p.viewers.contains(viewer))
            .unwrap_or(false)
    }

    /// Outposts currently on `viewer`'s screen.
    pub fn visible_outposts(&self, viewer: &str) -> Vec<OutpostId> {
        self.outposts
            .iter()
            .filter(|entry| entry.viewers.contains(viewer))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.updates.subscribe()
    }

    /// Apply a change and publish an update if the displayed state moved.
    fn mutate(&self, outpost_id: &str, change: impl FnOnce(&mut OutpostPresence)) {
        let update = {
            let mut presence = self.outposts.entry(outpost_id.to_string()).or_default();
            let before = presence.view(outpost_id);
            change(presence.value_mut());
            let after = presence.view(outpost_id);
            (before != after).then_some(after)
        };

        if let Some(update) = update {
            self.updates.publish(update);
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_replaces_count() {
        let tracker = PresenceTracker::new();
        tracker.apply_presence_snapshot("o1", 12);
        tracker.apply_presence_snapshot("o1", 5);
        assert_eq!(tracker.online_count("o1"), 5);
        assert_eq!(tracker.online_count("unknown"), 0);
    }

    #[test]
    fn test_local_visibility_does_not_change_displayed_count() {
        let tracker = PresenceTracker::new();
        tracker.apply_presence_snapshot("o1", 0);

        assert!(tracker.set_local_visibility("o1", "0xme", true));
        assert_eq!(tracker.online_count("o1"), 0);
        assert!(!tracker.is_live("o1"));
    }

    #[test]
    fn test_visibility_is_idempotent() {
        let tracker = PresenceTracker::new();
        assert!(tracker.set_local_visibility("o1", "0xme", true));
        assert!(!tracker.set_local_visibility("o1", "0xme", true));
        assert!(tracker.is_visible("o1", "0xme"));
        assert_eq!(tracker.visible_outposts("0xme"), vec!["o1".to_string()]);

        assert!(tracker.set_local_visibility("o1", "0xme", false));
        assert!(!tracker.set_local_visibility("o1", "0xme", false));
        assert!(!tracker.set_local_visibility("never-seen", "0xme", false));
        assert!(tracker.visible_outposts("0xme").is_empty());
    }

    #[test]
    fn test_liveness_from_members_or_count() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.is_live("o1"));

        tracker.member_joined("o1", "0xa");
        assert!(tracker.is_live("o1"));
        assert_eq!(tracker.online_count("o1"), 0);

        tracker.member_left("o1", "0xa");
        assert!(!tracker.is_live("o1"));

        tracker.apply_presence_snapshot("o1", 3);
        assert!(tracker.is_live("o1"));
    }

    #[test]
    fn test_duplicate_membership_events_are_harmless() {
        let tracker = PresenceTracker::new();
        tracker.member_joined("o1", "0xa");
        tracker.member_joined("o1", "0xa");
        assert_eq!(tracker.members("o1"), vec!["0xa".to_string()]);

        tracker.member_left("o1", "0xa");
        tracker.member_left("o1", "0xa");
        assert!(tracker.members("o1").is_empty());
    }

    #[test]
    fn test_forget_members_keeps_count() {
        let tracker = PresenceTracker::new();
        tracker.member_joined("o1", "0xa");
        tracker.apply_presence_snapshot("o1", 4);

        tracker.forget_members("o1");
        assert!(tracker.members("o1").is_empty());
        assert_eq!(tracker.online_count("o1"), 4);
    }

    #[tokio::test]
    async fn test_updates_only_on_displayed_change() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();

        tracker.apply_presence_snapshot("o1", 2);
        tracker.apply_presence_snapshot("o1", 2);
        tracker.set_local_visibility("o1", "0xme", true);
        tracker.apply_presence_snapshot("o1", 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.online_count, 2);
        assert!(first.live);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.online_count, 0);
        assert!(!second.live);

        assert!(rx.try_recv().is_err());
    }
}
