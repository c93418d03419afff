//! Egress-observed destination table.
//!
//! The egress observer records every non-private destination it sees leaving
//! the host; the ingress pipeline lets replies from those addresses skip the
//! rate limiter and the geo check while the record is fresh.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use kgguard_common::{is_private_ipv4, CONN_TRACK_TTL_NS, MAX_ACTIVE_CONNECTIONS};

use crate::lru::{LruTable, Recency};

/// Last time the host sent to this destination (ns)
pub struct ConnRecord {
    last_seen: AtomicU64,
}

impl Recency for ConnRecord {
    fn last_touched(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

pub struct ConnTracker {
    table: LruTable<Ipv4Addr, ConnRecord>,
    ttl_ns: u64,
}

impl Default for ConnTracker {
    fn default() -> Self {
        Self::with_max_entries(MAX_ACTIVE_CONNECTIONS)
    }
}

impl ConnTracker {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            table: LruTable::with_max_entries(max_entries),
            ttl_ns: CONN_TRACK_TTL_NS,
        }
    }

    /// Record an outbound packet to `dst`. Private destinations are ignored.
    /// Returns whether a record was written.
    pub fn record(&self, dst: Ipv4Addr, now_ns: u64) -> bool {
        if is_private_ipv4(u32::from(dst)) {
            return false;
        }
        self.table.upsert(
            dst,
            |r| r.last_seen.store(now_ns, Ordering::Relaxed),
            || ConnRecord {
                last_seen: AtomicU64::new(now_ns),
            },
        );
        true
    }

    /// True iff `src` was recorded less than the TTL ago.
    pub fn is_fresh(&self, src: Ipv4Addr, now_ns: u64) -> bool {
        self.table
            .with(&src, |r| {
                now_ns.saturating_sub(r.last_seen.load(Ordering::Relaxed)) < self.ttl_ns
            })
            .unwrap_or(false)
    }

    pub fn last_seen(&self, addr: Ipv4Addr) -> Option<u64> {
        self.table.with(&addr, |r| r.last_seen.load(Ordering::Relaxed))
    }

    pub fn remove(&self, addr: Ipv4Addr) -> bool {
        self.table.remove(&addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;
    const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

    #[test]
    fn fresh_within_ttl_only() {
        let ct = ConnTracker::default();
        let t = 1_000 * SEC;
        assert!(ct.record(SERVER, t));

        assert!(ct.is_fresh(SERVER, t));
        assert!(ct.is_fresh(SERVER, t + 30 * SEC));
        assert!(ct.is_fresh(SERVER, t + 60 * SEC - 1));
        assert!(!ct.is_fresh(SERVER, t + 60 * SEC));
        assert!(!ct.is_fresh(SERVER, t + 61 * SEC));
    }

    #[test]
    fn refresh_overwrites_timestamp() {
        let ct = ConnTracker::default();
        ct.record(SERVER, 0);
        ct.record(SERVER, 100 * SEC);
        assert_eq!(ct.last_seen(SERVER), Some(100 * SEC));
        assert!(ct.is_fresh(SERVER, 150 * SEC));
    }

    #[test]
    fn unknown_address_is_not_fresh() {
        let ct = ConnTracker::default();
        assert!(!ct.is_fresh(SERVER, 0));
    }

    #[test]
    fn private_destinations_are_never_recorded() {
        let ct = ConnTracker::default();
        for dst in [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(172, 20, 1, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(127, 0, 0, 1),
        ] {
            assert!(!ct.record(dst, 0));
        }
        assert!(ct.is_empty());
    }

    #[test]
    fn eviction_falls_back_to_not_fresh() {
        let ct = ConnTracker::with_max_entries(2);
        ct.record(Ipv4Addr::new(1, 1, 1, 1), 1);
        ct.record(Ipv4Addr::new(2, 2, 2, 2), 2);
        ct.record(Ipv4Addr::new(3, 3, 3, 3), 3);
        assert_eq!(ct.len(), 2);
        assert!(!ct.is_fresh(Ipv4Addr::new(1, 1, 1, 1), 4));
        assert!(ct.is_fresh(Ipv4Addr::new(3, 3, 3, 3), 4));
    }

    #[test]
    fn churn_keeps_recent_destinations() {
        let ct = ConnTracker::with_max_entries(1_000);
        let dst = |i: u32| Ipv4Addr::from(0x0100_0000 + i);
        for i in 0..1_000 {
            ct.record(dst(i), 1 + i as u64);
        }
        for i in 1_000..6_000 {
            ct.record(dst(i), 1 + i as u64);
        }

        let now = 6_001;
        assert!(ct.len() <= 1_000);
        assert!((0..1_000).all(|i| ct.last_seen(dst(i)).is_none()));
        assert!((5_900..6_000).all(|i| ct.is_fresh(dst(i), now)));
    }
}
