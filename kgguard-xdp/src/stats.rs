//! Statistics store: per-IP and per-port traffic tables plus fixed-slot
//! global counters. All counters only move through atomic adds.

use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kgguard_common::{
    PacketStats, GLOBAL_STATS_SLOTS, MAX_IP_STATS, MAX_PORT_STATS, STAT_ALLOWED, STAT_BLOCKED,
    STAT_CONN_BYPASS, STAT_EVENTS_LOST, STAT_GEOIP_BLOCKED, STAT_RATE_LIMITED, STAT_TOTAL_BYTES,
    STAT_TOTAL_PACKETS,
};
use serde::Serialize;

use crate::lru::{LruTable, Recency};

// ============================================================
// TRAFFIC RECORDS
// ============================================================

#[derive(Default)]
pub struct TrafficRecord {
    packets: AtomicU64,
    bytes: AtomicU64,
    last_seen: AtomicU64,
    blocked: AtomicU32,
}

impl TrafficRecord {
    fn seeded(packets: u64, bytes: u64, now_ns: u64, blocked: bool) -> Self {
        Self {
            packets: AtomicU64::new(packets),
            bytes: AtomicU64::new(bytes),
            last_seen: AtomicU64::new(now_ns),
            blocked: AtomicU32::new(blocked as u32),
        }
    }

    fn add(&self, bytes: u64, now_ns: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_seen.fetch_max(now_ns, Ordering::Relaxed);
    }

    fn mark_blocked(&self, now_ns: u64) {
        self.blocked.store(1, Ordering::Relaxed);
        self.last_seen.fetch_max(now_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PacketStats {
        PacketStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            last_seen: self.last_seen.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            _pad: 0,
        }
    }
}

impl Recency for TrafficRecord {
    fn last_touched(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}

/// Bounded traffic table keyed by source address or destination port.
pub struct TrafficTable<K> {
    table: LruTable<K, TrafficRecord>,
}

impl<K: Eq + Hash + Copy> TrafficTable<K> {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            table: LruTable::with_max_entries(max_entries),
        }
    }

    pub fn record(&self, key: K, bytes: u64, now_ns: u64) {
        self.table.upsert(
            key,
            |r| r.add(bytes, now_ns),
            || TrafficRecord::seeded(1, bytes, now_ns, false),
        );
    }

    pub fn mark_blocked(&self, key: K, now_ns: u64) {
        self.table.upsert(
            key,
            |r| r.mark_blocked(now_ns),
            || TrafficRecord::seeded(0, 0, now_ns, true),
        );
    }

    pub fn get(&self, key: &K) -> Option<PacketStats> {
        self.table.with(key, TrafficRecord::snapshot)
    }

    pub fn entries(&self, limit: usize) -> Vec<(K, PacketStats)> {
        let mut out = Vec::with_capacity(limit.min(self.table.len()));
        self.table
            .for_each_limited(limit, |k, r| out.push((*k, r.snapshot())));
        out
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

// ============================================================
// FIXED-SLOT COUNTERS
// ============================================================

/// Array of monotonic counters indexed by slot constant
pub struct Counters<const N: usize> {
    slots: [AtomicU64; N],
}

impl<const N: usize> Default for Counters<N> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl<const N: usize> Counters<N> {
    /// Out-of-range slots are ignored.
    #[inline(always)]
    pub fn add(&self, slot: u32, value: u64) {
        if let Some(c) = self.slots.get(slot as usize) {
            c.fetch_add(value, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn inc(&self, slot: u32) {
        self.add(slot, 1);
    }

    pub fn get(&self, slot: u32) -> u64 {
        self.slots
            .get(slot as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn values(&self) -> [u64; N] {
        std::array::from_fn(|i| self.slots[i].load(Ordering::Relaxed))
    }
}

pub type GlobalCounters = Counters<GLOBAL_STATS_SLOTS>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub blocked: u64,
    pub allowed: u64,
    pub rate_limited: u64,
    pub conn_bypass: u64,
    pub geoip_blocked: u64,
    pub events_lost: u64,
}

impl GlobalCounters {
    pub fn snapshot(&self) -> GlobalSnapshot {
        GlobalSnapshot {
            total_packets: self.get(STAT_TOTAL_PACKETS),
            total_bytes: self.get(STAT_TOTAL_BYTES),
            blocked: self.get(STAT_BLOCKED),
            allowed: self.get(STAT_ALLOWED),
            rate_limited: self.get(STAT_RATE_LIMITED),
            conn_bypass: self.get(STAT_CONN_BYPASS),
            geoip_blocked: self.get(STAT_GEOIP_BLOCKED),
            events_lost: self.get(STAT_EVENTS_LOST),
        }
    }
}

// ============================================================
// STATISTICS STORE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortTraffic {
    pub port: u16,
    pub packets: u64,
    pub bytes: u64,
}

/// Everything the observability surface reads
pub struct StatsStore {
    pub ip_stats: TrafficTable<Ipv4Addr>,
    pub port_stats: TrafficTable<u16>,
    pub global: GlobalCounters,
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::with_capacity(MAX_IP_STATS, MAX_PORT_STATS)
    }
}

impl StatsStore {
    pub fn with_capacity(ip_entries: usize, port_entries: usize) -> Self {
        Self {
            ip_stats: TrafficTable::with_max_entries(ip_entries),
            port_stats: TrafficTable::with_max_entries(port_entries),
            global: GlobalCounters::default(),
        }
    }

    /// Count one accepted packet against its source and destination port.
    /// Port 0 means unknown and is not recorded.
    pub fn record_traffic(&self, src: Ipv4Addr, dst_port: u16, bytes: u64, now_ns: u64) {
        self.ip_stats.record(src, bytes, now_ns);
        if dst_port > 0 {
            self.port_stats.record(dst_port, bytes, now_ns);
        }
    }

    pub fn record_totals(&self, bytes: u64) {
        self.global.inc(STAT_TOTAL_PACKETS);
        self.global.add(STAT_TOTAL_BYTES, bytes);
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        self.global.snapshot()
    }

    /// Per-source records, unordered.
    pub fn ip_entries(&self, limit: usize) -> Vec<(Ipv4Addr, PacketStats)> {
        self.ip_stats.entries(limit)
    }

    /// Busiest destination ports, most packets first.
    pub fn top_ports(&self, limit: usize) -> Vec<PortTraffic> {
        let mut ports: Vec<PortTraffic> = self
            .port_stats
            .entries(usize::MAX)
            .into_iter()
            .map(|(port, s)| PortTraffic {
                port,
                packets: s.packets,
                bytes: s.bytes,
            })
            .collect();
        ports.sort_unstable_by(|a, b| b.packets.cmp(&a.packets).then(a.port.cmp(&b.port)));
        ports.truncate(limit);
        ports
    }

    /// Drop per-IP and per-port records. Global counters keep counting.
    pub fn reset_traffic(&self) {
        let n = self.ip_stats.len();
        self.ip_stats.clear();
        self.port_stats.clear();
        log::info!("reset {} traffic stats entries", n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    #[test]
    fn records_accumulate() {
        let s = StatsStore::default();
        s.record_traffic(A, 27015, 100, 5);
        s.record_traffic(A, 27015, 50, 9);
        let r = s.ip_stats.get(&A).unwrap();
        assert_eq!((r.packets, r.bytes, r.last_seen, r.blocked), (2, 150, 9, 0));
        assert_eq!(s.port_stats.get(&27015).unwrap().packets, 2);
    }

    #[test]
    fn port_zero_is_not_recorded() {
        let s = StatsStore::default();
        s.record_traffic(A, 0, 60, 1);
        assert!(s.port_stats.is_empty());
        assert_eq!(s.ip_stats.len(), 1);
    }

    #[test]
    fn mark_blocked_creates_or_flags_record() {
        let s = StatsStore::default();
        s.ip_stats.mark_blocked(A, 3);
        let r = s.ip_stats.get(&A).unwrap();
        assert_eq!((r.packets, r.blocked), (0, 1));

        s.ip_stats.record(A, 10, 4);
        assert_eq!(s.ip_stats.get(&A).unwrap().blocked, 1);
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let s = StatsStore::default();
        s.record_traffic(A, 1, 1, 100);
        s.record_traffic(A, 1, 1, 50);
        assert_eq!(s.ip_stats.get(&A).unwrap().last_seen, 100);
    }

    #[test]
    fn top_ports_sorted_by_packets() {
        let s = StatsStore::default();
        for _ in 0..3 {
            s.record_traffic(A, 27015, 1, 0);
        }
        s.record_traffic(A, 7777, 1, 0);
        for _ in 0..5 {
            s.record_traffic(A, 25565, 1, 0);
        }
        let top: Vec<u16> = s.top_ports(2).iter().map(|p| p.port).collect();
        assert_eq!(top, vec![25565, 27015]);
    }

    #[test]
    fn reset_keeps_global_counters() {
        let s = StatsStore::default();
        s.record_totals(64);
        s.record_traffic(A, 80, 64, 0);
        s.reset_traffic();
        assert!(s.ip_stats.is_empty() && s.port_stats.is_empty());
        assert_eq!(s.snapshot().total_packets, 1);
        assert_eq!(s.snapshot().total_bytes, 64);
    }

    #[test]
    fn ip_table_is_bounded() {
        let s = StatsStore::with_capacity(16, 16);
        for i in 0..1_000u32 {
            s.record_traffic(Ipv4Addr::from(0x0100_0000 + i), (i % 100) as u16 + 1, 1, i as u64);
        }
        assert!(s.ip_stats.len() <= 16);
        assert!(s.port_stats.len() <= 16);
    }

    #[test]
    fn counters_ignore_unknown_slots() {
        let c = GlobalCounters::default();
        c.inc(STAT_ALLOWED);
        c.inc(99);
        assert_eq!(c.get(STAT_ALLOWED), 1);
        assert_eq!(c.get(99), 0);
        assert_eq!(c.values().iter().sum::<u64>(), 1);
    }
}
