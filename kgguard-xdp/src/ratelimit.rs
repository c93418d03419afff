//! Per-source token bucket.
//!
//! Refill is continuous: `elapsed_ns * pps / 1e9` tokens, with `elapsed`
//! capped at one second and the bucket capped at `pps`. A bucket is born with
//! `pps - 1` tokens, so the packet that creates it is the one it admits.

use std::cell::Cell;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use kgguard_common::{RateLimitState, MAX_RATE_LIMITS, RATE_REFILL_CAP_NS};
use parking_lot::Mutex;

use crate::lru::{LruTable, Recency};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
}

struct BucketCell {
    // tokens and last_update must move together
    state: Mutex<RateLimitState>,
    touched: AtomicU64,
}

impl Recency for BucketCell {
    fn last_touched(&self) -> u64 {
        self.touched.load(Ordering::Relaxed)
    }
}

/// Advance one bucket to `now_ns` and try to take a token.
///
/// A limited packet leaves the bucket untouched so partial refill keeps
/// accumulating toward the next token.
pub fn refill_and_take(state: &mut RateLimitState, now_ns: u64, pps: u32) -> RateDecision {
    let pps = pps as u64;
    let elapsed = now_ns
        .saturating_sub(state.last_update)
        .min(RATE_REFILL_CAP_NS);
    let add = elapsed * pps / 1_000_000_000;
    let tokens = state.tokens.saturating_add(add).min(pps);

    if tokens < 1 {
        return RateDecision::Limited;
    }
    state.tokens = tokens - 1;
    state.last_update = now_ns;
    RateDecision::Allowed
}

pub struct RateLimiter {
    buckets: LruTable<Ipv4Addr, BucketCell>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_max_entries(MAX_RATE_LIMITS)
    }
}

impl RateLimiter {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            buckets: LruTable::with_max_entries(max_entries),
        }
    }

    /// Take one token for `src`. `pps == 0` disables limiting entirely.
    pub fn consume(&self, src: Ipv4Addr, now_ns: u64, pps: u32) -> RateDecision {
        if pps == 0 {
            return RateDecision::Allowed;
        }

        // A freshly created bucket admits the packet that created it.
        let decision = Cell::new(RateDecision::Allowed);
        self.buckets.upsert(
            src,
            |cell| {
                cell.touched.store(now_ns, Ordering::Relaxed);
                decision.set(refill_and_take(&mut cell.state.lock(), now_ns, pps));
            },
            || BucketCell {
                state: Mutex::new(RateLimitState {
                    tokens: pps as u64 - 1,
                    last_update: now_ns,
                }),
                touched: AtomicU64::new(now_ns),
            },
        );
        decision.get()
    }

    /// Current bucket state for `src`, if one exists.
    pub fn peek(&self, src: Ipv4Addr) -> Option<RateLimitState> {
        self.buckets.with(&src, |cell| *cell.state.lock())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}
