//! Longest-prefix-match tables (whitelist, blacklist, geo-allow).
//!
//! Writers are the control plane; the pipeline only takes the read lock.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use kgguard_common::BlockEntry;
use parking_lot::RwLock;
use prefix_trie::PrefixMap;

use crate::error::TableError;

struct Inner<V> {
    map: PrefixMap<Ipv4Net, V>,
    len: usize,
}

/// Bounded LPM table keyed by IPv4 prefix.
pub struct LpmTable<V> {
    name: &'static str,
    max_entries: usize,
    inner: RwLock<Inner<V>>,
}

impl<V: Copy> LpmTable<V> {
    pub fn with_max_entries(name: &'static str, max_entries: usize) -> Self {
        Self {
            name,
            max_entries,
            inner: RwLock::new(Inner {
                map: PrefixMap::new(),
                len: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Insert or overwrite. Host bits are cleared before insertion.
    pub fn insert(&self, net: Ipv4Net, value: V) -> Result<Option<V>, TableError> {
        let net = net.trunc();
        let mut inner = self.inner.write();
        if inner.map.get(&net).is_none() && inner.len >= self.max_entries {
            return Err(TableError::TableFull {
                table: self.name,
                capacity: self.max_entries,
            });
        }
        let old = inner.map.insert(net, value);
        if old.is_none() {
            inner.len += 1;
        }
        Ok(old)
    }

    pub fn remove(&self, net: Ipv4Net) -> Option<V> {
        let net = net.trunc();
        let mut inner = self.inner.write();
        let old = inner.map.remove(&net);
        if old.is_some() {
            inner.len -= 1;
        }
        old
    }

    /// Most specific prefix covering `addr`.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<V> {
        let key = Ipv4Net::from(addr);
        self.inner.read().map.get_lpm(&key).map(|(_, v)| *v)
    }

    pub fn lookup_prefix(&self, addr: Ipv4Addr) -> Option<(Ipv4Net, V)> {
        let key = Ipv4Net::from(addr);
        self.inner.read().map.get_lpm(&key).map(|(p, v)| (*p, *v))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.lookup(addr).is_some()
    }

    /// Atomically swap the whole table for `entries`.
    ///
    /// Entries past capacity are rejected and reported; the swap still happens
    /// with everything that fit.
    pub fn replace_all<I>(&self, entries: I) -> Result<usize, TableError>
    where
        I: IntoIterator<Item = (Ipv4Net, V)>,
    {
        let mut map = PrefixMap::new();
        let mut len = 0usize;
        let mut overflow = false;
        for (net, value) in entries {
            let net = net.trunc();
            if map.get(&net).is_none() {
                if len >= self.max_entries {
                    overflow = true;
                    continue;
                }
                len += 1;
            }
            map.insert(net, value);
        }
        *self.inner.write() = Inner { map, len };
        if overflow {
            log::warn!("{}: truncated to {} entries", self.name, self.max_entries);
            return Err(TableError::TableFull {
                table: self.name,
                capacity: self.max_entries,
            });
        }
        Ok(len)
    }

    pub fn clear(&self) {
        *self.inner.write() = Inner {
            map: PrefixMap::new(),
            len: 0,
        };
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `limit` entries in prefix order.
    pub fn entries(&self, limit: usize) -> Vec<(Ipv4Net, V)> {
        self.inner
            .read()
            .map
            .iter()
            .take(limit)
            .map(|(p, v)| (*p, *v))
            .collect()
    }
}

// ============================================================
// BLACKLIST HELPERS
// ============================================================

/// Operator view of one blacklist match
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BlockedIpInfo {
    pub network: Ipv4Net,
    pub reason: u32,
    /// Monotonic expiry (ns), 0 = permanent
    pub expires_at: u64,
    /// Seconds left, -1 for permanent, 0 once expired
    pub ttl_secs: i64,
}

impl BlockedIpInfo {
    fn new(network: Ipv4Net, entry: BlockEntry, now_ns: u64) -> Self {
        let ttl_secs = if entry.expires_at == 0 {
            -1
        } else {
            (entry.expires_at.saturating_sub(now_ns) / 1_000_000_000) as i64
        };
        Self {
            network,
            reason: entry.reason,
            expires_at: entry.expires_at,
            ttl_secs,
        }
    }
}

/// Entry that blocks for `duration_ns` from `now_ns` (0 = permanent).
pub fn block_entry(duration_ns: u64, reason: u32, now_ns: u64) -> BlockEntry {
    let expires_at = if duration_ns == 0 {
        0
    } else {
        now_ns.saturating_add(duration_ns).max(1)
    };
    BlockEntry { expires_at, reason, _pad: 0 }
}

impl LpmTable<BlockEntry> {
    /// Block `net` for `duration_ns` (0 = permanent).
    pub fn block(
        &self,
        net: Ipv4Net,
        duration_ns: u64,
        reason: u32,
        now_ns: u64,
    ) -> Result<(), TableError> {
        self.insert(net, block_entry(duration_ns, reason, now_ns))?;
        log::info!("blocked {} ({})", net, kgguard_common::block_reason_str(reason));
        Ok(())
    }

    pub fn unblock(&self, net: Ipv4Net) -> bool {
        let removed = self.remove(net).is_some();
        if removed {
            log::info!("unblocked {}", net);
        }
        removed
    }

    /// Active entry covering `addr`, expired entries count as a miss.
    pub fn active_entry(&self, addr: Ipv4Addr, now_ns: u64) -> Option<BlockEntry> {
        self.lookup(addr).filter(|e| e.is_active(now_ns))
    }

    /// Matching entry for `addr`, including an expired one (ttl 0).
    pub fn lookup_blocked(&self, addr: Ipv4Addr, now_ns: u64) -> Option<BlockedIpInfo> {
        self.lookup_prefix(addr)
            .map(|(net, entry)| BlockedIpInfo::new(net, entry, now_ns))
    }

    pub fn blocked_entries(&self, limit: usize, now_ns: u64) -> Vec<BlockedIpInfo> {
        self.entries(limit)
            .into_iter()
            .map(|(net, entry)| BlockedIpInfo::new(net, entry, now_ns))
            .collect()
    }
}

/// Parse a bare IPv4 address (as /32) or CIDR. Host bits are cleared.
pub fn parse_cidr(input: &str) -> Result<Ipv4Net, TableError> {
    let s = input.trim();
    if let Ok(addr) = s.parse::<Ipv4Addr>() {
        return Ok(Ipv4Net::from(addr));
    }
    s.parse::<Ipv4Net>()
        .map(|n| n.trunc())
        .map_err(|_| TableError::invalid_prefix(s))
}
