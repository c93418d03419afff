//! Fuzz target for frame parsing and the full ingress pipeline
//!
//! Arbitrary bytes go through `parse_frame` in both link modes and through
//! `XdpFilter::evaluate` with hard blocking and rate limiting on. Nothing may
//! panic, and a frame that fails to parse must pass.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use kgguard_common::REASON_MALFORMED;
use kgguard_xdp::{parse_frame, LinkMode, Maps, XdpAction, XdpFilter};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    raw_ip: bool,
    hard_blocking: bool,
    pps: u8,
    now: u64,
    frame: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mode = if input.raw_ip { LinkMode::RawIp } else { LinkMode::Ethernet };

    if let Ok(pkt) = parse_frame(&input.frame, mode) {
        assert_eq!(pkt.total_len as usize, input.frame.len());
        if pkt.is_fragment {
            assert_eq!((pkt.src_port, pkt.dst_port, pkt.tcp_flags), (0, 0, 0));
        }
    }

    let maps = Arc::new(Maps::standalone());
    maps.config.set_link_mode(mode);
    maps.config.set_hard_blocking(input.hard_blocking);
    maps.config.set_rate_limit_pps(input.pps as u32);
    let filter = XdpFilter::new(maps);

    let first = filter.evaluate(&input.frame, input.now);
    if parse_frame(&input.frame, mode).is_err() {
        assert_eq!(first.reason, REASON_MALFORMED);
        assert_eq!(first.action, XdpAction::Pass);
    }
});
