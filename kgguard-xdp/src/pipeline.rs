//! Ingress decision pipeline.
//!
//! Stage order is fixed; the first terminal stage wins:
//!
//! 1. parse failure        -> PASS
//! 2. maintenance mode     -> PASS
//! 3. private source       -> PASS
//! 4. management port      -> PASS
//! 5. fragment             -> PASS
//! 6. whitelist            -> PASS (no blacklist, no rate limit)
//! 7. blacklist            -> DROP
//! 8. fresh egress peer    -> PASS
//! 9. rate limit exhausted -> DROP (no per-IP/port stats)
//! 10. traffic statistics
//! 11. protocol bypasses   -> PASS
//! 12. geo-allow miss      -> DROP if hard blocking, else PASS
//! 13. default             -> PASS

use std::sync::Arc;

use kgguard_common::*;

use crate::conntrack::ConnTracker;
use crate::config::ConfigMap;
use crate::events::EventSink;
use crate::lpm::LpmTable;
use crate::parsing::{parse_frame, PacketDescriptor};
use crate::pin::PinRegistry;
use crate::ports::PortSet;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::stats::StatsStore;

// ============================================================
// VERDICT
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpAction {
    Pass,
    Drop,
}

impl XdpAction {
    pub fn as_u8(self) -> u8 {
        match self {
            XdpAction::Pass => ACTION_PASS,
            XdpAction::Drop => ACTION_DROP,
        }
    }
}

/// Action plus the stage that decided it (REASON_* constant)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: XdpAction,
    pub reason: u8,
}

impl Verdict {
    pub const fn pass(reason: u8) -> Self {
        Self { action: XdpAction::Pass, reason }
    }

    pub const fn drop(reason: u8) -> Self {
        Self { action: XdpAction::Drop, reason }
    }

    pub fn is_drop(&self) -> bool {
        self.action == XdpAction::Drop
    }
}

// ============================================================
// SHARED MAPS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapCapacities {
    pub white_list: usize,
    pub blocked_ips: usize,
    pub geo_allowed: usize,
    pub active_connections: usize,
    pub rate_limits: usize,
    pub ip_stats: usize,
    pub port_stats: usize,
}

impl Default for MapCapacities {
    fn default() -> Self {
        Self {
            white_list: MAX_WHITE_LIST,
            blocked_ips: MAX_BLOCKED_IPS,
            geo_allowed: MAX_GEO_ALLOWED,
            active_connections: MAX_ACTIVE_CONNECTIONS,
            rate_limits: MAX_RATE_LIMITS,
            ip_stats: MAX_IP_STATS,
            port_stats: MAX_PORT_STATS,
        }
    }
}

/// All state the pipeline reads or writes.
///
/// Control-plane tables (`config`, the three prefix tables, `allowed_ports`)
/// are written by the control plane only. `active_connections` is shared with
/// the egress observer through the pin registry.
pub struct Maps {
    pub config: ConfigMap,
    pub white_list: LpmTable<u32>,
    pub blocked_ips: LpmTable<BlockEntry>,
    pub geo_allowed: LpmTable<u32>,
    pub allowed_ports: PortSet,
    pub active_connections: Arc<ConnTracker>,
    pub rate_limits: RateLimiter,
    pub stats: StatsStore,
    events: Option<EventSink>,
}

impl Maps {
    pub fn new(caps: MapCapacities, pins: &PinRegistry) -> Self {
        Self {
            config: ConfigMap::default(),
            white_list: LpmTable::with_max_entries("white_list", caps.white_list),
            blocked_ips: LpmTable::with_max_entries("blocked_ips", caps.blocked_ips),
            geo_allowed: LpmTable::with_max_entries("geo_allowed", caps.geo_allowed),
            allowed_ports: PortSet::default(),
            active_connections: pins
                .conn_tracker(ACTIVE_CONNECTIONS_PIN, caps.active_connections),
            rate_limits: RateLimiter::with_max_entries(caps.rate_limits),
            stats: StatsStore::with_capacity(caps.ip_stats, caps.port_stats),
            events: None,
        }
    }

    /// Maps with default capacities and a private connection table.
    pub fn standalone() -> Self {
        Self::new(MapCapacities::default(), &PinRegistry::default())
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }
}

// ============================================================
// PIPELINE
// ============================================================

pub struct XdpFilter {
    maps: Arc<Maps>,
}

impl XdpFilter {
    pub fn new(maps: Arc<Maps>) -> Self {
        Self { maps }
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    pub fn process(&self, frame: &[u8], now_ns: u64) -> XdpAction {
        self.evaluate(frame, now_ns).action
    }

    pub fn evaluate(&self, frame: &[u8], now_ns: u64) -> Verdict {
        // Fail-open on parse errors
        match parse_frame(frame, self.maps.config.link_mode()) {
            Ok(pkt) => self.evaluate_packet(&pkt, now_ns),
            Err(e) => {
                log::trace!("parse failure ({} bytes): {}", frame.len(), e);
                Verdict::pass(REASON_MALFORMED)
            }
        }
    }

    /// Stages 2..13 on an already parsed packet.
    pub fn evaluate_packet(&self, pkt: &PacketDescriptor, now_ns: u64) -> Verdict {
        let maps = &*self.maps;
        let src = pkt.src_addr;

        // --- MAINTENANCE MODE ---
        if maps.config.maintenance_mode() {
            return Verdict::pass(REASON_MAINTENANCE);
        }

        // --- PRIVATE NETWORKS ---
        if is_private_ipv4(u32::from(src)) {
            return Verdict::pass(REASON_PRIVATE);
        }

        // --- MANAGEMENT PORTS (SSH, WireGuard, admin panel) ---
        if is_management(pkt) {
            return Verdict::pass(REASON_MGMT_PORT);
        }

        // --- FRAGMENTS ---
        if pkt.is_fragment {
            return Verdict::pass(REASON_FRAGMENT);
        }

        // --- WHITELIST (before blacklist) ---
        if maps.white_list.contains(src) {
            self.record_accepted(pkt, now_ns);
            maps.stats.global.inc(STAT_ALLOWED);
            return Verdict::pass(REASON_WHITELIST);
        }

        // --- BLACKLIST ---
        if maps.blocked_ips.active_entry(src, now_ns).is_some() {
            maps.stats.global.inc(STAT_BLOCKED);
            maps.stats.ip_stats.mark_blocked(src, now_ns);
            return self.drop(pkt, REASON_BLACKLIST, now_ns);
        }

        // --- CONNECTION TRACKING (reply from a peer we contacted) ---
        if maps.active_connections.is_fresh(src, now_ns) {
            self.record_accepted(pkt, now_ns);
            maps.stats.global.inc(STAT_CONN_BYPASS);
            maps.stats.global.inc(STAT_ALLOWED);
            return Verdict::pass(REASON_CONNTRACK);
        }

        // --- PPS RATE LIMIT ---
        let pps = maps.config.rate_limit_pps();
        if maps.rate_limits.consume(src, now_ns, pps) == RateDecision::Limited {
            maps.stats.global.inc(STAT_RATE_LIMITED);
            return self.drop(pkt, REASON_RATELIMIT, now_ns);
        }

        // --- TRAFFIC STATS (past the DDoS gate) ---
        self.record_accepted(pkt, now_ns);

        // --- PROTOCOL BYPASSES ---
        if let Some(reason) = protocol_bypass(pkt, &maps.allowed_ports) {
            maps.stats.global.inc(STAT_ALLOWED);
            return Verdict::pass(reason);
        }

        // --- GEOIP ---
        if !maps.geo_allowed.contains(src) {
            if maps.config.hard_blocking() {
                maps.stats.global.inc(STAT_GEOIP_BLOCKED);
                maps.stats.global.inc(STAT_BLOCKED);
                maps.stats.ip_stats.mark_blocked(src, now_ns);
                return self.drop(pkt, REASON_GEOIP, now_ns);
            }
            maps.stats.global.inc(STAT_ALLOWED);
            return Verdict::pass(REASON_GEOIP_SOFT);
        }

        maps.stats.global.inc(STAT_ALLOWED);
        Verdict::pass(REASON_DEFAULT)
    }

    fn record_accepted(&self, pkt: &PacketDescriptor, now_ns: u64) {
        let bytes = pkt.total_len as u64;
        self.maps.stats.record_totals(bytes);
        self.maps
            .stats
            .record_traffic(pkt.src_addr, pkt.dst_port, bytes, now_ns);
    }

    fn drop(&self, pkt: &PacketDescriptor, reason: u8, now_ns: u64) -> Verdict {
        log::trace!(
            "DROP {} -> {}:{} proto={} reason={}",
            pkt.src_addr,
            pkt.dst_addr,
            pkt.dst_port,
            pkt.proto,
            reason_str(reason)
        );
        if let Some(sink) = &self.maps.events {
            if !sink.emit(drop_event(pkt, reason, now_ns)) {
                self.maps.stats.global.inc(STAT_EVENTS_LOST);
            }
        }
        Verdict::drop(reason)
    }
}

fn drop_event(pkt: &PacketDescriptor, reason: u8, now_ns: u64) -> DropEvent {
    DropEvent {
        src_ip: u32::from(pkt.src_addr),
        dst_ip: u32::from(pkt.dst_addr),
        src_port: pkt.src_port,
        dst_port: pkt.dst_port,
        proto: pkt.proto,
        reason,
        packet_len: u16::try_from(pkt.total_len).unwrap_or(u16::MAX),
        timestamp: now_ns,
    }
}

// ============================================================
// STAGE PREDICATES
// ============================================================

/// SSH and the admin panel by destination; WireGuard as UDP in either direction.
pub fn is_management(pkt: &PacketDescriptor) -> bool {
    if pkt.proto == PROTO_UDP && (pkt.dst_port == PORT_WIREGUARD || pkt.src_port == PORT_WIREGUARD)
    {
        return true;
    }
    (pkt.proto == PROTO_TCP || pkt.proto == PROTO_UDP)
        && (pkt.dst_port == PORT_SSH || pkt.dst_port == PORT_ADMIN_PANEL)
}

/// First matching protocol bypass, as a reason code.
pub fn protocol_bypass(pkt: &PacketDescriptor, allowed_ports: &PortSet) -> Option<u8> {
    if pkt.has_tcp_flag(TCP_FLAG_ACK | TCP_FLAG_RST) {
        return Some(REASON_TCP_ESTABLISHED);
    }
    if pkt.proto == PROTO_UDP {
        if pkt.payload_head == Some(A2S_QUERY_MARKER) {
            return Some(REASON_A2S_QUERY);
        }
        if SERVICE_SOURCE_PORTS.contains(&pkt.src_port) {
            return Some(REASON_SERVICE_REPLY);
        }
    }
    if pkt.dst_port != 0 && allowed_ports.contains(pkt.dst_port) {
        return Some(REASON_ALLOWED_PORT);
    }
    if pkt.proto == PROTO_ICMP {
        return Some(REASON_ICMP);
    }
    None
}
