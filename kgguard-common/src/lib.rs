//! kgguard Common - Single Source of Truth for all shared types
//!
//! This crate contains ALL shared structures between:
//! - kgguard-xdp (ingress decision pipeline)
//! - kgguard-tc (egress connection observer)
//! - kgguard-cli (control plane / operator CLI)
//!
//! IMPORTANT: Slot indices and reason codes are part of the dashboard contract.
//! Renumbering them breaks every consumer of the statistics surface.

#![no_std]

// ============================================================
// CONDITIONAL IMPORTS
// ============================================================

#[cfg(feature = "user")]
use serde::{Deserialize, Serialize};

// ============================================================
// DROP EVENT (pipeline -> control plane)
// ============================================================

/// Event emitted for every DROP verdict
/// Size: 24 bytes
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(Debug, Serialize, Deserialize))]
#[repr(C)]
pub struct DropEvent {
    pub src_ip: u32,       // 4  Source IPv4 (host byte order)
    pub dst_ip: u32,       // 4  Destination IPv4 (host byte order)
    pub src_port: u16,     // 2  Source port (0 = unknown)
    pub dst_port: u16,     // 2  Destination port (0 = unknown)
    pub proto: u8,         // 1  IP protocol number
    pub reason: u8,        // 1  Verdict reason (REASON_* constants)
    pub packet_len: u16,   // 2  Frame length, saturated to u16
    pub timestamp: u64,    // 8  Monotonic timestamp (ns)
}                          // Total: 24 bytes

// ============================================================
// TRAFFIC RECORDS (per-IP / per-port statistics)
// ============================================================

/// Snapshot of one per-IP or per-port traffic record
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(Debug, Serialize, Deserialize))]
#[repr(C)]
pub struct PacketStats {
    pub packets: u64,      // Packets accepted past the rate gate
    pub bytes: u64,        // Bytes of those packets
    pub last_seen: u64,    // Last update timestamp (ns)
    pub blocked: u32,      // 1 once a policy DROP was recorded for this key
    pub _pad: u32,         // Padding for alignment
}

// ============================================================
// BLOCKLIST VALUE
// ============================================================

/// Value stored in the blacklist prefix table
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(Debug, Serialize, Deserialize))]
#[repr(C)]
pub struct BlockEntry {
    pub expires_at: u64,   // Monotonic expiry (ns), 0 = permanent
    pub reason: u32,       // BLOCK_REASON_* constant
    pub _pad: u32,         // Padding for alignment
}

impl BlockEntry {
    pub const fn permanent(reason: u32) -> Self {
        Self { expires_at: 0, reason, _pad: 0 }
    }

    /// True while the entry still blocks at `now_ns`.
    #[inline(always)]
    pub const fn is_active(&self, now_ns: u64) -> bool {
        self.expires_at == 0 || now_ns < self.expires_at
    }
}

// Block reason constants
pub const BLOCK_REASON_MANUAL: u32 = 1;
pub const BLOCK_REASON_RATE_LIMIT: u32 = 2;
pub const BLOCK_REASON_GEOIP: u32 = 3;
pub const BLOCK_REASON_FLOOD: u32 = 4;

pub fn block_reason_str(reason: u32) -> &'static str {
    match reason {
        BLOCK_REASON_MANUAL => "manual",
        BLOCK_REASON_RATE_LIMIT => "rate_limit",
        BLOCK_REASON_GEOIP => "geoip",
        BLOCK_REASON_FLOOD => "flood",
        _ => "unknown",
    }
}

// ============================================================
// RATE LIMITING
// ============================================================

/// Token bucket state for rate limiting (per source IP)
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(Debug))]
#[repr(C)]
pub struct RateLimitState {
    pub tokens: u64,       // Current tokens available
    pub last_update: u64,  // Last refill timestamp (ns)
}

/// Refill window cap for a single computation
pub const RATE_REFILL_CAP_NS: u64 = 1_000_000_000;

// ============================================================
// GLOBAL STATISTICS SLOTS
// ============================================================

pub const GLOBAL_STATS_SLOTS: usize = 8;

pub const STAT_TOTAL_PACKETS: u32 = 0;   // Packets past the rate gate
pub const STAT_TOTAL_BYTES: u32 = 1;     // Bytes past the rate gate
pub const STAT_BLOCKED: u32 = 2;         // Policy drops (blacklist, geo)
pub const STAT_ALLOWED: u32 = 3;         // Allowed after policy evaluation
pub const STAT_RATE_LIMITED: u32 = 4;    // Token bucket exhausted
pub const STAT_CONN_BYPASS: u32 = 5;     // Fresh egress destination replies
pub const STAT_GEOIP_BLOCKED: u32 = 6;   // Geo-allow miss under hard blocking
pub const STAT_EVENTS_LOST: u32 = 7;     // Drop events not delivered (queue full)

// ============================================================
// EGRESS STATISTICS SLOTS
// ============================================================

pub const EGRESS_STATS_SLOTS: usize = 4;

pub const EGRESS_STAT_TRACKED: u32 = 0;  // Connection records refreshed
pub const EGRESS_STAT_TCP: u32 = 1;      // ... of which TCP
pub const EGRESS_STAT_UDP: u32 = 2;      // ... of which UDP
pub const EGRESS_STAT_TOTAL: u32 = 3;    // Non-private outbound packets

// ============================================================
// VERDICT REASON CONSTANTS (WHY action was taken)
// ============================================================

pub const REASON_DEFAULT: u8 = 0;         // No rule matched
pub const REASON_MALFORMED: u8 = 1;       // Header parse failure (fail-open)
pub const REASON_MAINTENANCE: u8 = 2;     // Maintenance mode bypass
pub const REASON_PRIVATE: u8 = 3;         // Private / loopback source
pub const REASON_MGMT_PORT: u8 = 4;       // SSH / WireGuard / admin panel
pub const REASON_FRAGMENT: u8 = 5;        // IPv4 fragment
pub const REASON_WHITELIST: u8 = 6;       // Whitelist prefix match
pub const REASON_BLACKLIST: u8 = 7;       // Blacklist prefix match
pub const REASON_CONNTRACK: u8 = 8;       // Reply from fresh egress destination
pub const REASON_RATELIMIT: u8 = 9;       // Token bucket exhausted
pub const REASON_TCP_ESTABLISHED: u8 = 10; // ACK or RST set
pub const REASON_A2S_QUERY: u8 = 11;      // All-ones query marker
pub const REASON_SERVICE_REPLY: u8 = 12;  // UDP from DNS/HTTP(S)/NTP
pub const REASON_ALLOWED_PORT: u8 = 13;   // Dynamic game port
pub const REASON_ICMP: u8 = 14;           // ICMP
pub const REASON_GEOIP: u8 = 15;          // Geo-allow miss, hard blocking
pub const REASON_GEOIP_SOFT: u8 = 16;     // Geo-allow miss, advisory only

pub fn reason_str(reason: u8) -> &'static str {
    match reason {
        REASON_DEFAULT => "DEFAULT",
        REASON_MALFORMED => "MALFORMED",
        REASON_MAINTENANCE => "MAINTENANCE",
        REASON_PRIVATE => "PRIVATE",
        REASON_MGMT_PORT => "MGMT_PORT",
        REASON_FRAGMENT => "FRAGMENT",
        REASON_WHITELIST => "WHITELIST",
        REASON_BLACKLIST => "BLACKLIST",
        REASON_CONNTRACK => "CONNTRACK",
        REASON_RATELIMIT => "RATELIMIT",
        REASON_TCP_ESTABLISHED => "TCP_ESTABLISHED",
        REASON_A2S_QUERY => "A2S_QUERY",
        REASON_SERVICE_REPLY => "SERVICE_REPLY",
        REASON_ALLOWED_PORT => "ALLOWED_PORT",
        REASON_ICMP => "ICMP",
        REASON_GEOIP => "GEOIP",
        REASON_GEOIP_SOFT => "GEOIP_SOFT",
        _ => "UNKNOWN",
    }
}

// ============================================================
// ACTION CONSTANTS
// ============================================================

pub const ACTION_PASS: u8 = 0;
pub const ACTION_DROP: u8 = 1;

// ============================================================
// CONFIG MAP KEYS
// ============================================================

pub const CONFIG_SLOTS: usize = 4;

pub const CFG_HARD_BLOCKING: u32 = 0;     // 1 = geo-allow miss drops
pub const CFG_RATE_LIMIT_PPS: u32 = 1;    // Packets/sec per source, 0 = off
pub const CFG_MAINTENANCE_MODE: u32 = 2;  // 1 = pass everything
pub const CFG_INTERFACE_MODE: u32 = 3;    // 0 = L2/Ethernet, 1 = L3/raw IP

// ============================================================
// PROTOCOL CONSTANTS (shared helpers)
// ============================================================

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================
// PORTS
// ============================================================

pub const PORT_SSH: u16 = 22;
pub const PORT_ADMIN_PANEL: u16 = 8080;
pub const PORT_WIREGUARD: u16 = 51820;

/// UDP source ports whose replies skip geo evaluation (DNS, HTTP, HTTPS, NTP)
pub const SERVICE_SOURCE_PORTS: [u16; 4] = [53, 80, 443, 123];

/// Steam A2S / Source engine query marker (first 4 UDP payload bytes)
pub const A2S_QUERY_MARKER: [u8; 4] = [0xFF; 4];

// ============================================================
// TABLE CAPACITIES
// ============================================================

pub const MAX_WHITE_LIST: usize = 10_000;
pub const MAX_BLOCKED_IPS: usize = 10_000;
pub const MAX_GEO_ALLOWED: usize = 600_000;
pub const MAX_ACTIVE_CONNECTIONS: usize = 50_000;
pub const MAX_RATE_LIMITS: usize = 100_000;
pub const MAX_IP_STATS: usize = 100_000;
pub const MAX_PORT_STATS: usize = 65_536;

// ============================================================
// CONNECTION TRACKING
// ============================================================

pub const CONN_TRACK_TTL_NS: u64 = 60 * 1_000_000_000; // 60 sec

/// Stable name of the table shared between ingress and egress
pub const ACTIVE_CONNECTIONS_PIN: &str = "active_connections";

// ============================================================
// ADDRESS CLASSIFICATION
// ============================================================

/// Private or loopback IPv4 (host byte order)
#[inline(always)]
pub const fn is_private_ipv4(ip: u32) -> bool {
    (ip & 0xFF00_0000) == 0x0A00_0000        // 10.0.0.0/8
        || (ip & 0xFFF0_0000) == 0xAC10_0000 // 172.16.0.0/12
        || (ip & 0xFFFF_0000) == 0xC0A8_0000 // 192.168.0.0/16
        || (ip & 0xFF00_0000) == 0x7F00_0000 // 127.0.0.0/8
}
