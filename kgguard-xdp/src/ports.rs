//! Dynamic allowed-port set: one bit per port, lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

const WORDS: usize = 65_536 / 64;

pub struct PortSet {
    bits: Box<[AtomicU64]>,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            bits: (0..WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

#[inline(always)]
fn locate(port: u16) -> (usize, u64) {
    ((port / 64) as usize, 1u64 << (port % 64))
}

impl PortSet {
    #[inline(always)]
    pub fn contains(&self, port: u16) -> bool {
        let (w, mask) = locate(port);
        self.bits[w].load(Ordering::Relaxed) & mask != 0
    }

    /// Returns true if the port was newly added.
    pub fn insert(&self, port: u16) -> bool {
        let (w, mask) = locate(port);
        self.bits[w].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    pub fn remove(&self, port: u16) -> bool {
        let (w, mask) = locate(port);
        self.bits[w].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    /// Clear and refill. Readers may briefly see a partial set.
    pub fn replace_all(&self, ports: impl IntoIterator<Item = u16>) {
        self.clear();
        for p in ports {
            self.insert(p);
        }
    }

    pub fn clear(&self) {
        for w in self.bits.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.bits
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..=u16::MAX).filter(move |p| self.contains(*p))
    }
}
