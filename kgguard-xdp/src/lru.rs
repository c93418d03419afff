//! Bounded concurrent hash table with approximate-LRU eviction.
//!
//! Stands in for a kernel `LRU_HASH` map. Hits only take a shard read lock;
//! values carry their own atomics (or a per-key mutex) for mutation.
//! When a miss would exceed capacity, the table is scanned and the least
//! recently touched eighth is evicted in one batch, so the scan cost is spread
//! over the inserts that refill it. Under concurrent misses more than one
//! batch may be evicted.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Share of the table reclaimed per eviction pass (1 / N)
const EVICTION_FRACTION: usize = 8;

/// Values that know when they were last touched (ns).
pub trait Recency {
    fn last_touched(&self) -> u64;
}

pub struct LruTable<K, V> {
    map: DashMap<K, V>,
    max_entries: usize,
}

impl<K, V> LruTable<K, V>
where
    K: Eq + Hash + Copy,
    V: Recency,
{
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            map: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Run `f` on the value for `key`, if present.
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.get(key).map(|v| f(v.value()))
    }

    /// Apply `on_hit` to the existing value, or insert `init()`.
    ///
    /// Two racing misses for the same key resolve through the entry API: one
    /// inserts, the other sees the inserted value and takes `on_hit`.
    pub fn upsert(&self, key: K, on_hit: impl Fn(&V), init: impl FnOnce() -> V) {
        if let Some(v) = self.map.get(&key) {
            on_hit(v.value());
            return;
        }

        if self.map.len() >= self.max_entries {
            self.evict_batch();
        }

        match self.map.entry(key) {
            Entry::Occupied(e) => on_hit(e.get()),
            Entry::Vacant(e) => {
                e.insert(init());
            }
        }
    }

    /// Insert or overwrite without reading the old value.
    pub fn insert(&self, key: K, value: V) {
        if !self.map.contains_key(&key) && self.map.len() >= self.max_entries {
            self.evict_batch();
        }
        self.map.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Visit up to `limit` entries. Holds shard read locks while running.
    pub fn for_each_limited(&self, limit: usize, mut f: impl FnMut(&K, &V)) {
        for entry in self.map.iter().take(limit) {
            f(entry.key(), entry.value());
        }
    }

    fn evict_batch(&self) {
        let batch = (self.max_entries / EVICTION_FRACTION).max(1);
        // Iterator guards must be gone before `remove` takes a write lock.
        let mut ages: Vec<(u64, K)> = self
            .map
            .iter()
            .map(|e| (e.value().last_touched(), *e.key()))
            .collect();
        if ages.len() > batch {
            ages.select_nth_unstable_by_key(batch - 1, |(t, _)| *t);
            ages.truncate(batch);
        }
        for (_, key) in ages {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Touch(AtomicU64);

    impl Recency for Touch {
        fn last_touched(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn never_exceeds_capacity() {
        let t = LruTable::with_max_entries(8);
        for k in 0u32..100 {
            t.upsert(k, |_| {}, || Touch(AtomicU64::new(k as u64)));
            assert!(t.len() <= 8);
        }
        assert!(t.contains_key(&99));
    }

    #[test]
    fn evicts_least_recent() {
        let t = LruTable::with_max_entries(4);
        for k in 0u32..4 {
            t.insert(k, Touch(AtomicU64::new(100 + k as u64)));
        }
        t.with(&0, |v| v.0.store(1_000, Ordering::Relaxed));
        t.insert(9, Touch(AtomicU64::new(2_000)));
        assert!(t.contains_key(&0));
        assert!(!t.contains_key(&1));
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let t = LruTable::with_max_entries(2);
        t.insert(1u32, Touch(AtomicU64::new(1)));
        t.insert(2, Touch(AtomicU64::new(2)));
        t.insert(2, Touch(AtomicU64::new(3)));
        assert!(t.contains_key(&1));
        assert_eq!(t.with(&2, |v| v.last_touched()), Some(3));
    }

    #[test]
    fn concurrent_upserts_count_every_hit() {
        let t = Arc::new(LruTable::with_max_entries(1024));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        t.upsert(
                            7u32,
                            |v: &Touch| {
                                v.0.fetch_add(1, Ordering::Relaxed);
                            },
                            || Touch(AtomicU64::new(1)),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.with(&7, |v| v.last_touched()), Some(8_000));
    }

    #[test]
    fn churn_evicts_oldest_first() {
        let t = LruTable::with_max_entries(1_000);
        for k in 0u32..1_000 {
            t.insert(k, Touch(AtomicU64::new(1 + k as u64)));
        }
        for k in 1_000u32..6_000 {
            t.insert(k, Touch(AtomicU64::new(1 + k as u64)));
            assert!(t.len() <= 1_000);
        }

        let mut stale = 0;
        let mut recent = 0;
        t.for_each_limited(usize::MAX, |k, _| {
            if *k < 1_000 {
                stale += 1;
            }
            if *k >= 5_000 {
                recent += 1;
            }
        });
        assert_eq!(stale, 0);
        assert_eq!(recent, t.len());
        assert!(t.len() > 1_000 - 1_000 / EVICTION_FRACTION);
        assert!(t.contains_key(&5_999));
    }
}
