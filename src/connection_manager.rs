//! Per-origin admission control
//!
//! Counts live connections per IP inside a reset-on-expiry window.
//! This is the only hub state behind a lock: it is consulted during the
//! handshake, before a client exists or the hub knows about it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct OriginRecord {
    count: u32,
    last_seen: Instant,
}

/// Connection counter keyed by origin address
#[derive(Debug)]
pub struct ConnectionManager {
    origins: Mutex<HashMap<IpAddr, OriginRecord>>,
    max_per_origin: u32,
    window: Duration,
}

impl ConnectionManager {
    pub fn new(max_per_origin: u32, window: Duration) -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
            max_per_origin,
            window,
        }
    }

    /// Whether `ip` may open another connection right now
    pub fn can_connect(&self, ip: IpAddr) -> bool {
        self.can_connect_at(ip, Instant::now())
    }

    fn can_connect_at(&self, ip: IpAddr, now: Instant) -> bool {
        let origins = self.origins.lock();
        self.admits(&origins, ip, now)
    }

    fn admits(&self, origins: &HashMap<IpAddr, OriginRecord>, ip: IpAddr, now: Instant) -> bool {
        match origins.get(&ip) {
            None => true,
            Some(record) => {
                now.saturating_duration_since(record.last_seen) > self.window
                    || record.count < self.max_per_origin
            }
        }
    }

    /// Check and record in one step; false if `ip` is over its ceiling
    pub fn try_add_connection(&self, ip: IpAddr) -> bool {
        self.try_add_connection_at(ip, Instant::now())
    }

    fn try_add_connection_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut origins = self.origins.lock();
        if !self.admits(&origins, ip, now) {
            return false;
        }
        self.record(&mut origins, ip, now);
        true
    }

    /// Record a newly admitted connection from `ip`
    pub fn add_connection(&self, ip: IpAddr) {
        self.add_connection_at(ip, Instant::now());
    }

    fn add_connection_at(&self, ip: IpAddr, now: Instant) {
        let mut origins = self.origins.lock();
        self.record(&mut origins, ip, now);
    }

    fn record(&self, origins: &mut HashMap<IpAddr, OriginRecord>, ip: IpAddr, now: Instant) {
        let window = self.window;
        origins
            .entry(ip)
            .and_modify(|record| {
                if now.saturating_duration_since(record.last_seen) > window {
                    record.count = 1;
                } else {
                    record.count = record.count.saturating_add(1);
                }
                record.last_seen = now;
            })
            .or_insert(OriginRecord {
                count: 1,
                last_seen: now,
            });
    }

    /// Release one connection slot for `ip`
    pub fn remove_connection(&self, ip: IpAddr) {
        let mut origins = self.origins.lock();
        if let Some(record) = origins.get_mut(&ip) {
            record.count = record.count.saturating_sub(1);
            if record.count == 0 {
                origins.remove(&ip);
                debug!(%ip, "origin record released");
            }
        }
    }

    /// Current count for `ip` (0 when untracked)
    pub fn connection_count(&self, ip: IpAddr) -> u32 {
        self.origins.lock().get(&ip).map_or(0, |r| r.count)
    }

    pub fn tracked_origins(&self) -> usize {
        self.origins.lock().len()
    }
}

/// Holds one admitted slot; releases it on drop
#[derive(Debug)]
pub struct OriginSlot {
    manager: Arc<ConnectionManager>,
    ip: IpAddr,
}

impl OriginSlot {
    /// Reserve a slot only if `ip` is under its ceiling
    pub fn try_acquire(manager: Arc<ConnectionManager>, ip: IpAddr) -> Option<Self> {
        manager
            .try_add_connection(ip)
            .then(|| Self { manager, ip })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for OriginSlot {
    fn drop(&mut self) {
        self.manager.remove_connection(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_unknown_origin_admitted() {
        let manager = ConnectionManager::new(2, Duration::from_secs(300));
        assert!(manager.can_connect(ip(1)));
        assert_eq!(manager.connection_count(ip(1)), 0);
    }

    #[test]
    fn test_ceiling_reached() {
        let manager = ConnectionManager::new(2, Duration::from_secs(300));
        let now = Instant::now();

        manager.add_connection_at(ip(1), now);
        assert!(manager.can_connect_at(ip(1), now));
        manager.add_connection_at(ip(1), now);
        assert!(!manager.can_connect_at(ip(1), now));

        // Other origins are unaffected
        assert!(manager.can_connect_at(ip(2), now));
    }

    #[test]
    fn test_window_expiry_readmits_without_remove() {
        let window = Duration::from_secs(300);
        let manager = ConnectionManager::new(2, window);
        let start = Instant::now();

        manager.add_connection_at(ip(1), start);
        manager.add_connection_at(ip(1), start);
        assert!(!manager.can_connect_at(ip(1), start + window));

        let later = start + window + Duration::from_secs(1);
        assert!(manager.can_connect_at(ip(1), later));

        // Adding after expiry resets the counter
        manager.add_connection_at(ip(1), later);
        assert_eq!(manager.connection_count(ip(1)), 1);
    }

    #[test]
    fn test_remove_deletes_at_zero() {
        let manager = ConnectionManager::new(5, Duration::from_secs(300));
        manager.add_connection(ip(1));
        manager.add_connection(ip(1));
        assert_eq!(manager.tracked_origins(), 1);

        manager.remove_connection(ip(1));
        assert_eq!(manager.connection_count(ip(1)), 1);
        manager.remove_connection(ip(1));
        assert_eq!(manager.tracked_origins(), 0);

        // Removing an unknown origin is a no-op
        manager.remove_connection(ip(3));
        assert_eq!(manager.tracked_origins(), 0);
    }

    #[test]
    fn test_slot_releases_on_drop() {
        let manager = Arc::new(ConnectionManager::new(5, Duration::from_secs(300)));
        {
            let slot = OriginSlot::try_acquire(manager.clone(), ip(4)).unwrap();
            assert_eq!(slot.ip(), ip(4));
            assert_eq!(manager.connection_count(ip(4)), 1);
        }
        assert_eq!(manager.connection_count(ip(4)), 0);
    }

    #[test]
    fn test_try_acquire_is_atomic() {
        let manager = Arc::new(ConnectionManager::new(3, Duration::from_secs(300)));

        let slots: Vec<Option<OriginSlot>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let manager = manager.clone();
                    scope.spawn(move || OriginSlot::try_acquire(manager, ip(5)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(slots.iter().filter(|s| s.is_some()).count(), 3);
        assert_eq!(manager.connection_count(ip(5)), 3);
        drop(slots);
        assert_eq!(manager.connection_count(ip(5)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_follows_runtime_clock() {
        let manager = ConnectionManager::new(1, Duration::from_secs(300));
        assert!(manager.try_add_connection(ip(6)));
        assert!(!manager.try_add_connection(ip(6)));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(manager.can_connect(ip(6)));
        assert!(manager.try_add_connection(ip(6)));
        assert_eq!(manager.connection_count(ip(6)), 1);
    }
}
