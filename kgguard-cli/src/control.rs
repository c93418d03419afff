//! Control plane: turns a `KgConfig` into populated engine tables.

use std::sync::Arc;

use anyhow::Result;
use ipnet::Ipv4Net;
use serde::Serialize;

use kgguard_tc::TcEgress;
use kgguard_common::BlockEntry;
use kgguard_xdp::clock::monotonic_ns;
use kgguard_xdp::{
    block_entry, parse_cidr, EventReceiver, EventSink, LpmTable, Maps, PinRegistry, TableError,
    XdpFilter,
};

use crate::config::{parse_block_reason, unix_now, KgConfig};
use crate::geo;

const NS_PER_SEC: u64 = 1_000_000_000;

/// Engine clock and wall clock, read together. Block rules carry wall-clock
/// expiries and are re-anchored to the engine clock when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    /// Monotonic ns, what the filter compares against
    pub engine_ns: u64,
    pub unix_secs: u64,
}

impl Now {
    pub fn current() -> Self {
        Self::at(monotonic_ns())
    }

    /// Wall clock now, engine clock at `engine_ns` (trace time for replay).
    pub fn at(engine_ns: u64) -> Self {
        Self { engine_ns, unix_secs: unix_now() }
    }
}

/// Ingress filter, egress observer, and the tables they share.
pub struct Engine {
    pub pins: PinRegistry,
    pub maps: Arc<Maps>,
    pub filter: XdpFilter,
    pub egress: TcEgress,
    pub events: Option<EventReceiver>,
    pub applied: ApplySummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub whitelist: usize,
    pub blacklist: usize,
    pub geo_allowed: usize,
    pub allowed_ports: usize,
    pub skipped: usize,
    /// Timed block rules already past their expiry
    pub expired: usize,
    /// Hard blocking was requested but no geo data loaded
    pub geo_fail_safe: bool,
}

impl Engine {
    /// Build and populate every table from `cfg`. Drop events are queued only
    /// when `with_events` is set.
    pub fn from_config(cfg: &KgConfig, now: Now, with_events: bool) -> Result<Self> {
        let pins = PinRegistry::default();
        let mut maps = Maps::new(cfg.capacity.to_capacities(), &pins);
        let events = if with_events {
            let (sink, rx) = EventSink::channel(cfg.events.queue_depth);
            maps = maps.with_events(sink);
            Some(rx)
        } else {
            None
        };

        let applied = apply_config(&maps, cfg, now)?;
        let maps = Arc::new(maps);

        let egress = TcEgress::attach(&pins);
        egress.config.set_link_mode(cfg.link_mode());

        Ok(Self {
            filter: XdpFilter::new(Arc::clone(&maps)),
            pins,
            maps,
            egress,
            events,
            applied,
        })
    }
}

/// Push `cfg` into `maps`, replacing list contents. Bad entries are logged and
/// skipped; only an unreadable geo CIDR file is an error.
pub fn apply_config(maps: &Maps, cfg: &KgConfig, now: Now) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    // --- WHITELIST ---
    let (entries, bad) = parse_all(cfg.effective_allowlist().iter().map(String::as_str));
    summary.skipped += bad;
    summary.whitelist = replace_logged(&maps.white_list, entries.into_iter().map(|n| (n, 1)));

    // --- BLACKLIST ---
    let mut blocks: Vec<(Ipv4Net, BlockEntry)> = Vec::with_capacity(cfg.blocklist.entries.len());
    for rule in &cfg.blocklist.entries {
        let (net, reason) = match (parse_cidr(&rule.cidr), parse_block_reason(&rule.reason)) {
            (Ok(net), Some(reason)) => (net, reason),
            _ => {
                log::warn!("skipping block rule {} ({})", rule.cidr, rule.reason);
                summary.skipped += 1;
                continue;
            }
        };
        let Some(remaining) = rule.remaining_secs(now.unix_secs) else {
            log::debug!("block on {} expired", net);
            summary.expired += 1;
            continue;
        };
        let duration_ns = remaining.saturating_mul(NS_PER_SEC);
        blocks.push((net, block_entry(duration_ns, reason, now.engine_ns)));
    }
    summary.blacklist = replace_logged(&maps.blocked_ips, blocks);

    // --- GEO ALLOW ---
    let mut geo_entries: Vec<(Ipv4Net, u32)> = Vec::new();
    for (code, cidrs) in &cfg.geo.countries {
        let Some(packed) = geo::pack_country(code) else {
            log::warn!("skipping invalid country code '{}'", code);
            summary.skipped += cidrs.len();
            continue;
        };
        let (nets, bad) = parse_all(cidrs.iter().map(String::as_str));
        summary.skipped += bad;
        geo_entries.extend(nets.into_iter().map(|n| (n, packed)));
    }
    if let Some(path) = &cfg.geo.cidr_file {
        let loaded = geo::load_country_cidrs(path)?;
        geo_entries.extend(loaded.into_iter().map(|(cc, net)| (net, cc)));
    }
    summary.geo_allowed = replace_logged(&maps.geo_allowed, geo_entries);

    // --- ALLOWED PORTS ---
    maps.allowed_ports
        .replace_all(cfg.ports.allowed.iter().copied().filter(|p| *p != 0));
    summary.allowed_ports = maps.allowed_ports.len();

    // --- RUNTIME TOGGLES ---
    let mut hard_blocking = cfg.filter.hard_blocking;
    if hard_blocking && summary.geo_allowed == 0 {
        log::warn!("No GeoIP data loaded! Disabling hard blocking to prevent lockout");
        hard_blocking = false;
        summary.geo_fail_safe = true;
    }
    maps.config.set_hard_blocking(hard_blocking);
    maps.config.set_rate_limit_pps(cfg.filter.rate_limit_pps);
    maps.config.set_maintenance_mode(cfg.filter.maintenance_mode);
    maps.config.set_link_mode(cfg.link_mode());

    log::info!(
        "tables loaded: {} allowed, {} blocked, {} geo prefixes, {} ports ({} skipped, {} expired)",
        summary.whitelist,
        summary.blacklist,
        summary.geo_allowed,
        summary.allowed_ports,
        summary.skipped,
        summary.expired
    );
    Ok(summary)
}

fn parse_all<'a>(items: impl Iterator<Item = &'a str>) -> (Vec<Ipv4Net>, usize) {
    let mut nets = Vec::new();
    let mut bad = 0;
    for item in items {
        match parse_cidr(item) {
            Ok(net) => nets.push(net),
            Err(e) => {
                log::warn!("{}", e);
                bad += 1;
            }
        }
    }
    (nets, bad)
}

fn replace_logged<V: Copy>(table: &LpmTable<V>, entries: impl IntoIterator<Item = (Ipv4Net, V)>) -> usize {
    match table.replace_all(entries) {
        Ok(n) => n,
        Err(TableError::TableFull { .. }) => table.len(),
        Err(e) => {
            log::warn!("{}: {}", table.name(), e);
            table.len()
        }
    }
}
