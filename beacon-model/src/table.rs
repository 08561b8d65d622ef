//! Process-wide activity table.
//!
//! Both activity producers (the rich-presence server and the game-detection
//! service) publish into one of these; the orchestrator drains them with a
//! read-clears snapshot so a change is consumed exactly once.

use crate::Activity;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Concurrent activity table keyed by application id.
#[derive(Debug, Default)]
pub struct ActivityTable {
    entries: DashMap<String, Activity>,
    changed: AtomicBool,
}

impl ActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the activity for an application. The change flag is
    /// only raised when the stored value actually differs.
    pub fn publish(&self, application_id: &str, activity: Activity) {
        match self.entries.get(application_id) {
            Some(existing) if *existing == activity => return,
            _ => {}
        }
        self.entries.insert(application_id.to_string(), activity);
        self.changed.store(true, Ordering::Release);
    }

    /// Remove an application's activity (client disconnected or game exited).
    pub fn remove(&self, application_id: &str) {
        if self.entries.remove(application_id).is_some() {
            self.changed.store(true, Ordering::Release);
        }
    }

    /// Whether an application currently has a published activity.
    pub fn contains(&self, application_id: &str) -> bool {
        self.entries.contains_key(application_id)
    }

    /// Snapshot the table if it changed since the last take (or always, when
    /// forced). Reading clears the change flag.
    pub fn take(&self, force: bool) -> Option<Vec<Activity>> {
        if self.changed.swap(false, Ordering::AcqRel) || force {
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// Unconditional snapshot, leaving the change flag untouched.
    pub fn snapshot(&self) -> Vec<Activity> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_take() {
        let table = ActivityTable::new();
        table.publish("1", Activity::playing("1", "Foo", 0));
        let snapshot = table.take(false).unwrap();
        assert_eq!(snapshot.len(), 1);
        // Read clears the flag.
        assert!(table.take(false).is_none());
        // Force still returns the snapshot.
        assert_eq!(table.take(true).unwrap().len(), 1);
    }

    #[test]
    fn test_identical_publish_does_not_flag() {
        let table = ActivityTable::new();
        let activity = Activity::playing("1", "Foo", 0);
        table.publish("1", activity.clone());
        table.take(false);
        table.publish("1", activity);
        assert!(table.take(false).is_none());
    }

    #[test]
    fn test_remove_flags_change() {
        let table = ActivityTable::new();
        table.publish("1", Activity::playing("1", "Foo", 0));
        table.take(false);
        table.remove("1");
        assert!(table.take(false).unwrap().is_empty());
        // Removing an absent key is silent.
        table.remove("1");
        assert!(table.take(false).is_none());
    }
}
