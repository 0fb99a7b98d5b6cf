//! User presence tracking
//!
//! Presence is per user, not per connection. The tracker is owned by the
//! hub loop and never shared, so it needs no locking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::PresenceEntry;
use crate::types::UserId;

/// User-visible presence status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Dnd => "dnd",
            PresenceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Last known presence of one user
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub status_message: String,
    pub last_seen: DateTime<Utc>,
}

/// In-memory presence table
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's status, creating the record if needed
    pub fn set_status(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        status_message: impl Into<String>,
    ) -> &PresenceRecord {
        self.set_status_at(user_id, status, status_message.into(), Utc::now())
    }

    fn set_status_at(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        status_message: String,
        now: DateTime<Utc>,
    ) -> &PresenceRecord {
        let record = self.records.entry(user_id).or_insert_with(|| PresenceRecord {
            user_id,
            status,
            status_message: String::new(),
            last_seen: now,
        });
        record.status = status;
        record.status_message = status_message;
        record.last_seen = now;
        record
    }

    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }

    /// Refresh `last_seen` without changing the status
    pub fn touch(&mut self, user_id: UserId) {
        if let Some(record) = self.records.get_mut(&user_id) {
            record.last_seen = Utc::now();
        }
    }

    /// Drop `offline` records last seen longer than `retention` ago
    ///
    /// Returns the number of records removed.
    pub fn gc(&mut self, retention: Duration) -> usize {
        self.gc_at(Utc::now(), retention)
    }

    fn gc_at(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = self.records.len();
        self.records.retain(|_, r| {
            r.status != PresenceStatus::Offline || now.signed_duration_since(r.last_seen) <= retention
        });
        before - self.records.len()
    }

    /// Roster of every known user, ordered by user id
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.records.values().map(PresenceEntry::from).collect();
        entries.sort_by_key(|e| e.user_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.get(UserId(1)).is_none());

        tracker.set_status(UserId(1), PresenceStatus::Online, "");
        let record = tracker.get(UserId(1)).unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
        assert!(record.status_message.is_empty());

        tracker.set_status(UserId(1), PresenceStatus::Dnd, "focus time");
        let record = tracker.get(UserId(1)).unwrap();
        assert_eq!(record.status, PresenceStatus::Dnd);
        assert_eq!(record.status_message, "focus time");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_gc_removes_only_stale_offline() {
        let mut tracker = PresenceTracker::new();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(25);

        tracker.set_status_at(UserId(1), PresenceStatus::Offline, String::new(), old);
        tracker.set_status_at(UserId(2), PresenceStatus::Offline, String::new(), now);
        tracker.set_status_at(UserId(3), PresenceStatus::Online, String::new(), old);

        let removed = tracker.gc_at(now, Duration::from_secs(24 * 3600));
        assert_eq!(removed, 1);
        assert!(tracker.get(UserId(1)).is_none());
        assert!(tracker.get(UserId(2)).is_some());
        // Online users are never collected, however old
        assert!(tracker.get(UserId(3)).is_some());
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut tracker = PresenceTracker::new();
        tracker.set_status(UserId(9), PresenceStatus::Idle, "");
        tracker.set_status(UserId(2), PresenceStatus::Online, "hello");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].user_id, UserId(2));
        assert_eq!(snapshot[0].status_msg.as_deref(), Some("hello"));
        assert_eq!(snapshot[1].user_id, UserId(9));
        assert!(snapshot[1].status_msg.is_none());
    }

    #[test]
    fn test_status_serialize() {
        assert_eq!(serde_json::to_string(&PresenceStatus::Dnd).unwrap(), "\"dnd\"");
        let status: PresenceStatus = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(status, PresenceStatus::Idle);
    }
}
