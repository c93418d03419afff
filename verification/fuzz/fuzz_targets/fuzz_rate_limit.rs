//! Fuzz target for the token bucket
//!
//! Drives `refill_and_take` and `RateLimiter` with arbitrary clocks and rates;
//! tokens must never exceed the rate and a limited packet must not move state.

#![no_main]

use std::net::Ipv4Addr;

use arbitrary::Arbitrary;
use kgguard_common::RateLimitState;
use kgguard_xdp::ratelimit::refill_and_take;
use kgguard_xdp::{RateDecision, RateLimiter};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    pps: u32,
    tokens: u64,
    last_update: u64,
    steps: Vec<(u8, u32)>, // (source index, time delta ns)
}

fuzz_target!(|input: Input| {
    if input.pps == 0 {
        return;
    }
    let pps = input.pps as u64;

    // Raw bucket arithmetic
    let mut state = RateLimitState {
        tokens: input.tokens.min(pps),
        last_update: input.last_update,
    };
    let mut now = input.last_update;
    for &(_, delta) in &input.steps {
        now = now.saturating_add(delta as u64);
        let before = state;
        match refill_and_take(&mut state, now, input.pps) {
            RateDecision::Allowed => assert!(state.tokens < pps && state.last_update == now),
            RateDecision::Limited => assert_eq!(state, before),
        }
        assert!(state.tokens <= pps);
    }

    // Table-level: a bounded limiter never exceeds its capacity
    let limiter = RateLimiter::with_max_entries(8);
    let mut now = 0u64;
    for &(src, delta) in &input.steps {
        now = now.saturating_add(delta as u64);
        let _ = limiter.consume(Ipv4Addr::new(198, 51, 100, src), now, input.pps);
        assert!(limiter.len() <= 8);
        if let Some(s) = limiter.peek(Ipv4Addr::new(198, 51, 100, src)) {
            assert!(s.tokens <= pps);
        }
    }
});
