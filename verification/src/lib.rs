//! kgguard Verification Module
//!
//! Formal verification and property-based testing for the filter's
//! decision logic.
//!
//! ## Verification Layers:
//! 1. **Kani Model Checking** - Proves absence of panics and overflows in the
//!    bucket arithmetic and record helpers
//! 2. **Property-Based Testing** - Random packets and tables against the real
//!    ingress pipeline and egress observer
//! 3. **Fuzzing** - Coverage-guided mutation of parser, limiter, and prefix
//!    tables (see `fuzz/`)

use kgguard_common::*;

// ============================================================
// INVARIANTS (Properties that MUST always hold)
// ============================================================

/// Invariant: DropEvent is exactly 24 bytes for the event queue
pub const DROP_EVENT_SIZE_INVARIANT: usize = 24;

/// Invariant: PacketStats snapshot is exactly 32 bytes
pub const PACKET_STATS_SIZE_INVARIANT: usize = 32;

// ============================================================
// COMPILE-TIME ASSERTIONS (Zero runtime cost)
// ============================================================

const _: () = {
    assert!(core::mem::size_of::<DropEvent>() == DROP_EVENT_SIZE_INVARIANT);
    assert!(core::mem::size_of::<PacketStats>() == PACKET_STATS_SIZE_INVARIANT);

    // BlockEntry: u64 expiry + u32 reason + pad
    assert!(core::mem::size_of::<BlockEntry>() == 16);

    assert!(core::mem::size_of::<RateLimitState>() == 16);

    // Egress slots sit inside the egress counter array
    assert!((EGRESS_STAT_TOTAL as usize) < EGRESS_STATS_SLOTS);
    assert!((STAT_EVENTS_LOST as usize) < GLOBAL_STATS_SLOTS);
    assert!((CFG_INTERFACE_MODE as usize) < CONFIG_SLOTS);
};

// ============================================================
// KANI PROOFS (Formal Verification)
// ============================================================

#[cfg(kani)]
mod kani_proofs {
    use super::*;
    use kgguard_xdp::ratelimit::{refill_and_take, RateDecision};

    /// Prove: refill never overflows and never exceeds the bucket cap
    #[kani::proof]
    fn verify_refill_bounded() {
        let tokens: u64 = kani::any();
        let last_update: u64 = kani::any();
        let now: u64 = kani::any();
        let pps: u32 = kani::any();

        kani::assume(pps > 0);
        kani::assume(tokens <= pps as u64);

        let mut state = RateLimitState { tokens, last_update };
        let decision = refill_and_take(&mut state, now, pps);

        assert!(state.tokens < pps as u64 || decision == RateDecision::Limited);
        assert!(state.tokens <= pps as u64);
    }

    /// Prove: a limited packet leaves the bucket untouched
    #[kani::proof]
    fn verify_limited_is_readonly() {
        let last_update: u64 = kani::any();
        let now: u64 = kani::any();
        let pps: u32 = kani::any();
        kani::assume(pps > 0);

        let before = RateLimitState { tokens: 0, last_update };
        let mut state = before;
        if refill_and_take(&mut state, now, pps) == RateDecision::Limited {
            assert!(state == before);
        }
    }

    /// Prove: a clock that goes backwards refills nothing
    #[kani::proof]
    fn verify_backwards_clock_no_refill() {
        let last_update: u64 = kani::any();
        let now: u64 = kani::any();
        let pps: u32 = kani::any();
        kani::assume(pps > 0);
        kani::assume(now <= last_update);

        let mut state = RateLimitState { tokens: 0, last_update };
        assert!(refill_and_take(&mut state, now, pps) == RateDecision::Limited);
    }

    /// Prove: permanent block entries are active at every instant
    #[kani::proof]
    fn verify_permanent_block_active() {
        let reason: u32 = kani::any();
        let now: u64 = kani::any();
        assert!(BlockEntry::permanent(reason).is_active(now));
    }

    /// Prove: private classification covers exactly the four ranges
    #[kani::proof]
    fn verify_private_ranges() {
        let ip: u32 = kani::any();
        let first = ip >> 24;
        let second = (ip >> 16) & 0xFF;
        let expected = first == 10
            || first == 127
            || (first == 172 && (16..32).contains(&second))
            || (first == 192 && second == 168);
        assert!(is_private_ipv4(ip) == expected);
    }
}

// ============================================================
// FRAME BUILDERS (shared by the tests below)
// ============================================================


// ============================================================
// PROPERTY-BASED TESTS (proptest)
// ============================================================

#[cfg(test)]
mod property_tests {
    use super::frames::*;
    use super::*;
    use ipnet::Ipv4Net;
    use kgguard_tc::TcEgress;
    use kgguard_xdp::{
        MapCapacities, Maps, PinRegistry, RateDecision, RateLimiter, Verdict, XdpAction,
        XdpFilter,
    };
    use proptest::prelude::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const SEC: u64 = 1_000_000_000;

    fn filter() -> XdpFilter {
        XdpFilter::new(Arc::new(Maps::standalone()))
    }

    fn public_ip() -> impl Strategy<Value = Ipv4Addr> {
        any::<u32>()
            .prop_filter("public source", |ip| !is_private_ipv4(*ip))
            .prop_map(Ipv4Addr::from)
    }

    fn private_ip() -> impl Strategy<Value = Ipv4Addr> {
        prop_oneof![
            any::<u32>().prop_map(|ip| 0x0A00_0000 | (ip & 0x00FF_FFFF)),
            any::<u32>().prop_map(|ip| 0xAC10_0000 | (ip & 0x000F_FFFF)),
            any::<u32>().prop_map(|ip| 0xC0A8_0000 | (ip & 0x0000_FFFF)),
            any::<u32>().prop_map(|ip| 0x7F00_0000 | (ip & 0x00FF_FFFF)),
        ]
        .prop_map(Ipv4Addr::from)
    }

    proptest! {
        /// Property: private and loopback sources always pass, whatever the tables say
        #[test]
        fn prop_private_source_always_passes(
            src in private_ip(),
            dport: u16,
            pps in 0u32..4,
            hard: bool,
        ) {
            let f = filter();
            let maps = f.maps();
            maps.blocked_ips.block("0.0.0.0/0".parse().unwrap(), 0, BLOCK_REASON_MANUAL, 0).unwrap();
            maps.config.set_hard_blocking(hard);
            maps.config.set_rate_limit_pps(pps);

            let frame = udp(src, HOST, 40_000, dport);
            for i in 0..5u64 {
                prop_assert_eq!(f.evaluate(&frame, i), Verdict::pass(REASON_PRIVATE));
            }
        }

        /// Property: whitelisted sources pass and never touch a rate bucket
        #[test]
        fn prop_whitelist_passes_without_rate_state(src in public_ip(), burst in 1usize..20) {
            let f = filter();
            let maps = f.maps();
            maps.white_list.insert(Ipv4Net::from(src), 1).unwrap();
            maps.blocked_ips.block(Ipv4Net::from(src), 0, BLOCK_REASON_MANUAL, 0).unwrap();
            maps.config.set_rate_limit_pps(1);
            maps.config.set_hard_blocking(true);

            for i in 0..burst {
                prop_assert_eq!(f.evaluate(&game(src), i as u64), Verdict::pass(REASON_WHITELIST));
            }
            prop_assert!(maps.rate_limits.peek(src).is_none());
        }

        /// Property: blacklisted sources drop even when geo-allowed
        #[test]
        fn prop_blacklist_beats_geo_allow(src in public_ip(), prefix in 8u8..=32) {
            let f = filter();
            let maps = f.maps();
            let net = Ipv4Net::new(src, prefix).unwrap().trunc();
            maps.blocked_ips.block(net, 0, BLOCK_REASON_MANUAL, 0).unwrap();
            maps.geo_allowed.insert(net, 0x4B52).unwrap();

            prop_assert_eq!(f.evaluate(&game(src), 0), Verdict::drop(REASON_BLACKLIST));
        }

        /// Property: a burst of pps + 1 admits exactly pps, then one token per 1/pps seconds
        #[test]
        fn prop_token_bucket_burst_and_refill(src in public_ip(), pps in 1u32..2000, start in 0u64..SEC) {
            let limiter = RateLimiter::default();
            let mut allowed = 0u32;
            let mut limited = 0u32;
            for i in 0..=pps as u64 {
                match limiter.consume(src, start + i, pps) {
                    RateDecision::Allowed => allowed += 1,
                    RateDecision::Limited => limited += 1,
                }
            }
            prop_assert_eq!(allowed, pps);
            prop_assert!(limited >= 1);

            // Bucket is empty; its clock sits at the last admitted packet
            let last = start + pps as u64 - 1;
            let wait = SEC.div_ceil(pps as u64);
            let t = last + wait;
            prop_assert_eq!(limiter.consume(src, t, pps), RateDecision::Allowed);
            prop_assert_eq!(limiter.consume(src, t, pps), RateDecision::Limited);
        }

        /// Property: an egress record bypasses geo and rate limiting for the TTL only
        #[test]
        fn prop_conntrack_window(peer in public_ip(), t0 in 0u64..1_000 * SEC) {
            let pins = PinRegistry::default();
            let maps = Arc::new(Maps::new(MapCapacities::default(), &pins));
            maps.config.set_hard_blocking(true);
            maps.config.set_rate_limit_pps(1);
            let xdp = XdpFilter::new(Arc::clone(&maps));
            let tc = TcEgress::attach(&pins);

            tc.classify(&udp(HOST, peer, 40_000, 27010), t0);

            let reply = udp(peer, HOST, 27010, 40_000);
            prop_assert_eq!(xdp.evaluate(&reply, t0 + 30 * SEC), Verdict::pass(REASON_CONNTRACK));
            prop_assert_eq!(xdp.evaluate(&reply, t0 + 30 * SEC + 1), Verdict::pass(REASON_CONNTRACK));
            prop_assert_eq!(xdp.evaluate(&reply, t0 + 61 * SEC), Verdict::drop(REASON_GEOIP));
        }

        /// Property: geo-allow miss passes in soft mode and drops in hard mode
        #[test]
        fn prop_geo_soft_vs_hard(src in public_ip()) {
            let f = filter();
            prop_assert_eq!(f.evaluate(&game(src), 0), Verdict::pass(REASON_GEOIP_SOFT));
            f.maps().config.set_hard_blocking(true);
            prop_assert_eq!(f.evaluate(&game(src), 0), Verdict::drop(REASON_GEOIP));
        }

        /// Property: anything shorter than Ethernet + minimal IPv4 passes as malformed
        #[test]
        fn prop_short_frames_pass(bytes in proptest::collection::vec(any::<u8>(), 0..34)) {
            let f = filter();
            f.maps().config.set_hard_blocking(true);
            f.maps().config.set_rate_limit_pps(1);
            prop_assert_eq!(f.evaluate(&bytes, 0), Verdict::pass(REASON_MALFORMED));
        }

        /// Property: arbitrary bytes never panic, and parse failures never drop
        #[test]
        fn prop_arbitrary_bytes_fail_open(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let f = filter();
            f.maps().config.set_hard_blocking(true);
            let v = f.evaluate(&bytes, 0);
            if v.reason == REASON_MALFORMED {
                prop_assert_eq!(v.action, XdpAction::Pass);
            }
        }

        /// Property: identical input and tables give identical verdicts
        #[test]
        fn prop_verdict_is_repeatable(
            src in public_ip(),
            sport: u16,
            dport: u16,
            hard: bool,
            allowed_port: u16,
        ) {
            let a = filter();
            let b = filter();
            for f in [&a, &b] {
                f.maps().config.set_hard_blocking(hard);
                f.maps().allowed_ports.insert(allowed_port);
            }
            let frame = udp(src, HOST, sport, dport);
            let first = a.evaluate(&frame, 0);
            prop_assert_eq!(first, a.evaluate(&frame, 0));
            prop_assert_eq!(first, b.evaluate(&frame, 0));
        }

        /// Property: every DROP is explained by a policy stage
        #[test]
        fn prop_drops_only_from_policy(
            src in public_ip(),
            sport: u16,
            dport: u16,
            hard: bool,
            pps in 0u32..3,
        ) {
            let f = filter();
            f.maps().config.set_hard_blocking(hard);
            f.maps().config.set_rate_limit_pps(pps);
            let frame = udp(src, HOST, sport, dport);
            for i in 0..4u64 {
                let v = f.evaluate(&frame, i);
                if v.is_drop() {
                    prop_assert!(matches!(v.reason, REASON_RATELIMIT | REASON_GEOIP));
                }
            }
        }
    }
}

// ============================================================
// DETERMINISTIC UNIT TESTS
// ============================================================

#[cfg(test)]
mod unit_tests {
    use super::frames::*;
    use super::*;
    use kgguard_xdp::{Maps, XdpFilter};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<DropEvent>(), 24);
        assert_eq!(core::mem::size_of::<PacketStats>(), 32);
        assert_eq!(core::mem::size_of::<BlockEntry>(), 16);
        assert_eq!(core::mem::size_of::<RateLimitState>(), 16);
    }

    #[test]
    fn test_capacities() {
        assert!(MAX_GEO_ALLOWED >= MAX_BLOCKED_IPS);
        assert!(MAX_PORT_STATS >= u16::MAX as usize);
        assert_eq!(CONN_TRACK_TTL_NS, 60_000_000_000);
    }

    #[test]
    fn test_parallel_burst_respects_bucket() {
        // One source spread over several threads still gets exactly pps
        let maps = Arc::new(Maps::standalone());
        maps.config.set_rate_limit_pps(100);
        let src = std::net::Ipv4Addr::new(45, 9, 9, 9);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = XdpFilter::new(Arc::clone(&maps));
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| f.evaluate(&game(src), 0).reason != REASON_RATELIMIT)
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 100);
        let g = maps.stats.snapshot();
        assert_eq!(g.rate_limited, 100);
        assert_eq!(g.total_packets, 100);
    }
}
