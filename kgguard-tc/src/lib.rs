//! kgguard TC Egress Observer
//!
//! Watches outbound traffic and refreshes the shared connection table so the
//! ingress filter can let replies through. It never drops a packet.
//! Shared types come from kgguard-common.

use std::sync::Arc;

use kgguard_xdp::stats::Counters;
use kgguard_xdp::{parse_frame, ConfigMap, ConnTracker, PinRegistry};
use serde::Serialize;

// ============================================================
// IMPORTS FROM kgguard-common
// ============================================================
use kgguard_common::{
    is_private_ipv4,
    // Table naming
    ACTIVE_CONNECTIONS_PIN, MAX_ACTIVE_CONNECTIONS,
    // Egress counter slots
    EGRESS_STATS_SLOTS, EGRESS_STAT_TCP, EGRESS_STAT_TOTAL, EGRESS_STAT_TRACKED, EGRESS_STAT_UDP,
    // Protocols
    PROTO_TCP, PROTO_UDP,
};

/// Classifier result. Only `Ok` exists: the observer is pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcAction {
    Ok,
}

pub type EgressCounters = Counters<EGRESS_STATS_SLOTS>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EgressSnapshot {
    pub tracked: u64,
    pub tcp: u64,
    pub udp: u64,
    pub total: u64,
}

// ============================================================
// EGRESS OBSERVER
// ============================================================

pub struct TcEgress {
    connections: Arc<ConnTracker>,
    /// Only the interface mode slot is read here
    pub config: ConfigMap,
    stats: EgressCounters,
}

impl TcEgress {
    pub fn new(connections: Arc<ConnTracker>) -> Self {
        Self {
            connections,
            config: ConfigMap::default(),
            stats: EgressCounters::default(),
        }
    }

    /// Attach to the connection table the ingress side uses.
    pub fn attach(pins: &PinRegistry) -> Self {
        Self::new(pins.conn_tracker(ACTIVE_CONNECTIONS_PIN, MAX_ACTIVE_CONNECTIONS))
    }

    pub fn connections(&self) -> &Arc<ConnTracker> {
        &self.connections
    }

    pub fn classify(&self, frame: &[u8], now_ns: u64) -> TcAction {
        let pkt = match parse_frame(frame, self.config.link_mode()) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::trace!("egress parse failure: {}", e);
                return TcAction::Ok;
            }
        };

        // --- SKIP PRIVATE / LOOPBACK DESTINATIONS ---
        if is_private_ipv4(u32::from(pkt.dst_addr)) {
            return TcAction::Ok;
        }

        self.stats.inc(EGRESS_STAT_TOTAL);
        match pkt.proto {
            PROTO_TCP => self.stats.inc(EGRESS_STAT_TCP),
            PROTO_UDP => self.stats.inc(EGRESS_STAT_UDP),
            _ => {}
        }

        // --- CONNECTION TRACKING ---
        if self.connections.record(pkt.dst_addr, now_ns) {
            self.stats.inc(EGRESS_STAT_TRACKED);
        }

        TcAction::Ok
    }

    pub fn snapshot(&self) -> EgressSnapshot {
        EgressSnapshot {
            tracked: self.stats.get(EGRESS_STAT_TRACKED),
            tcp: self.stats.get(EGRESS_STAT_TCP),
            udp: self.stats.get(EGRESS_STAT_UDP),
            total: self.stats.get(EGRESS_STAT_TOTAL),
        }
    }
}
