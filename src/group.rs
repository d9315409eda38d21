//! Assigns a `group_id` to each forward mutation: the active batch frame's
//! group if one is open, otherwise a time-window merge of ungrouped
//! changes, otherwise a fresh id.

use crate::record::Clock;
use std::time::{Duration, Instant};

/// A monotonic source of fresh group identifiers, plus the bookkeeping
/// needed to merge ungrouped changes arriving within `merge_window`.
#[derive(Debug)]
pub struct GroupTracker {
    next_id: u64,
    last_ungrouped: Option<(u64, Instant)>,
}

impl GroupTracker {
    pub fn new() -> Self {
        GroupTracker { next_id: 1, last_ungrouped: None }
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// A brand-new id, independent of any ungrouped-merge window. Used for
    /// batch frames (each open frame gets its own group) and for redo
    /// (replayed records always start a new undo point).
    pub fn new_group(&mut self) -> u64 {
        let id = self.fresh_id();
        self.last_ungrouped = None;
        id
    }

    /// Resolves the group id for an ungrouped (non-batched) mutation,
    /// merging into the previous ungrouped change if one happened within
    /// `window` and `merge_enabled` is set.
    pub fn ungrouped_id(&mut self, clock: &dyn Clock, window: Duration, merge_enabled: bool) -> u64 {
        let now = clock.now();
        if merge_enabled {
            if let Some((id, last_seen)) = self.last_ungrouped {
                if now.saturating_duration_since(last_seen) <= window {
                    self.last_ungrouped = Some((id, now));
                    return id;
                }
            }
        }
        let id = self.fresh_id();
        self.last_ungrouped = Some((id, now));
        id
    }

    /// Clears the ungrouped-merge window, e.g. when a batch frame opens.
    pub fn reset_ungrouped(&mut self) {
        self.last_ungrouped = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    #[test]
    fn merges_ungrouped_changes_within_window() {
        let mut tracker = GroupTracker::new();
        let clock = ManualClock::new();
        let a = tracker.ungrouped_id(&clock, Duration::from_millis(50), true);
        clock.advance(Duration::from_millis(10));
        let b = tracker.ungrouped_id(&clock, Duration::from_millis(50), true);
        assert_eq!(a, b);
    }

    #[test]
    fn splits_group_after_window_elapses() {
        let mut tracker = GroupTracker::new();
        let clock = ManualClock::new();
        let a = tracker.ungrouped_id(&clock, Duration::from_millis(50), true);
        clock.advance(Duration::from_millis(100));
        let b = tracker.ungrouped_id(&clock, Duration::from_millis(50), true);
        assert_ne!(a, b);
    }

    #[test]
    fn new_group_always_fresh() {
        let mut tracker = GroupTracker::new();
        let a = tracker.new_group();
        let b = tracker.new_group();
        assert_ne!(a, b);
    }
}
