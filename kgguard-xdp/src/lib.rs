//! kgguard ingress engine.
//!
//! Userspace rendition of the XDP filter: every kernel map becomes a bounded
//! concurrent table and the program body becomes [`XdpFilter::evaluate`].
//! Callers pass the monotonic time in; [`clock::monotonic_ns`] supplies it for
//! live traffic.

pub mod clock;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod events;
pub mod headers;
pub mod lpm;
pub mod lru;
pub mod parsing;
pub mod pin;
pub mod pipeline;
pub mod ports;
pub mod ratelimit;
pub mod stats;

pub use config::ConfigMap;
pub use conntrack::ConnTracker;
pub use error::{ConfigError, ParseError, TableError};
pub use events::{EventReceiver, EventSink, DEFAULT_EVENT_QUEUE};
pub use lpm::{block_entry, parse_cidr, BlockedIpInfo, LpmTable};
pub use parsing::{parse_frame, LinkMode, PacketDescriptor};
pub use pin::PinRegistry;
pub use pipeline::{MapCapacities, Maps, Verdict, XdpAction, XdpFilter};
pub use ports::PortSet;
pub use ratelimit::{RateDecision, RateLimiter};
pub use stats::{Counters, GlobalSnapshot, PortTraffic, StatsStore};
