//! Trace replay.
//!
//! A trace is a text file of `<millis> <in|out> <hex frame>` lines. Outbound
//! frames go through the egress observer in order; the inbound frames between
//! two outbound ones are split across worker threads.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};

use kgguard_common::{reason_str, DropEvent};
use kgguard_tc::EgressSnapshot;
use kgguard_xdp::{EventReceiver, GlobalSnapshot, PortTraffic, XdpAction, XdpFilter};

use crate::config::proto_to_str;
use crate::control::Engine;
use crate::geo::{self, SharedGeoLookup};

pub const TOP_PORTS_LIMIT: usize = 100;

// =============================================================================
// TRACE FORMAT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub at_ns: u64,
    pub direction: Direction,
    pub frame: Vec<u8>,
}

pub fn parse_trace_line(line: &str) -> Result<Option<TraceRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (Some(ms), Some(dir), Some(hex_frame), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("expected `<millis> <in|out> <hex>`");
    };
    let ms: u64 = ms.parse().with_context(|| format!("bad timestamp '{}'", ms))?;
    let direction = match dir {
        "in" => Direction::Inbound,
        "out" => Direction::Outbound,
        other => bail!("bad direction '{}'", other),
    };
    let frame = hex::decode(hex_frame).context("bad hex frame")?;
    Ok(Some(TraceRecord {
        at_ns: ms.saturating_mul(1_000_000),
        direction,
        frame,
    }))
}

pub fn parse_trace(content: &str) -> Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let parsed = parse_trace_line(line).with_context(|| format!("trace line {}", n + 1))?;
        records.extend(parsed);
    }
    Ok(records)
}

// =============================================================================
// DROP EVENT AGGREGATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedDrop {
    pub src_ip: Ipv4Addr,
    pub reason: &'static str,
    pub count: u64,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    pub last_dst_port: u16,
    pub proto: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Groups drop events by (source, reason). New keys past `limit` are counted
/// in `overflow` and otherwise ignored.
pub struct DropAggregator {
    entries: HashMap<(u32, u8), AggregatedDrop>,
    limit: usize,
    pub overflow: u64,
}

impl DropAggregator {
    pub fn new(limit: usize) -> Self {
        Self { entries: HashMap::new(), limit, overflow: 0 }
    }

    pub fn add(&mut self, ev: DropEvent) {
        let key = (ev.src_ip, ev.reason);
        if let Some(agg) = self.entries.get_mut(&key) {
            agg.count += 1;
            agg.first_seen_ns = agg.first_seen_ns.min(ev.timestamp);
            agg.last_seen_ns = agg.last_seen_ns.max(ev.timestamp);
            agg.last_dst_port = ev.dst_port;
            return;
        }
        if self.entries.len() >= self.limit {
            self.overflow += 1;
            return;
        }
        self.entries.insert(key, AggregatedDrop {
            src_ip: Ipv4Addr::from(ev.src_ip),
            reason: reason_str(ev.reason),
            count: 1,
            first_seen_ns: ev.timestamp,
            last_seen_ns: ev.timestamp,
            last_dst_port: ev.dst_port,
            proto: proto_to_str(ev.proto),
            country: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Busiest first, annotated with country codes when a database is open.
    pub fn into_sorted(self, geo_db: &SharedGeoLookup) -> Vec<AggregatedDrop> {
        let mut out: Vec<AggregatedDrop> = self.entries.into_values().collect();
        out.sort_unstable_by(|a, b| {
            b.count.cmp(&a.count).then(a.src_ip.cmp(&b.src_ip)).then(a.reason.cmp(b.reason))
        });
        for agg in &mut out {
            agg.country = geo::country_of(geo_db, agg.src_ip);
        }
        out
    }
}

/// Consume `rx` until `stop` fires, then drain what is still queued.
pub fn spawn_aggregator(
    mut rx: EventReceiver,
    limit: usize,
) -> (oneshot::Sender<()>, JoinHandle<DropAggregator>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut agg = DropAggregator::new(limit);
        loop {
            tokio::select! {
                biased;
                ev = rx.recv() => match ev {
                    Some(ev) => agg.add(ev),
                    None => break,
                },
                _ = &mut stop_rx => {
                    while let Ok(ev) = rx.try_recv() {
                        agg.add(ev);
                    }
                    break;
                }
            }
        }
        log::debug!("aggregated {} drop keys ({} over limit)", agg.len(), agg.overflow);
        agg
    });
    (stop_tx, handle)
}

// =============================================================================
// REPLAY
// =============================================================================

#[derive(Debug, Default, Clone)]
struct Tally {
    passed: u64,
    dropped: u64,
    by_reason: BTreeMap<u8, u64>,
}

impl Tally {
    fn record(&mut self, action: XdpAction, reason: u8) {
        match action {
            XdpAction::Pass => self.passed += 1,
            XdpAction::Drop => self.dropped += 1,
        }
        *self.by_reason.entry(reason).or_default() += 1;
    }

    fn merge(&mut self, other: Tally) {
        self.passed += other.passed;
        self.dropped += other.dropped;
        for (reason, n) in other.by_reason {
            *self.by_reason.entry(reason).or_default() += n;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub inbound: u64,
    pub outbound: u64,
    pub passed: u64,
    pub dropped: u64,
    pub by_reason: BTreeMap<&'static str, u64>,
    pub global: GlobalSnapshot,
    pub egress: EgressSnapshot,
    pub tracked_connections: usize,
    pub top_ports: Vec<PortTraffic>,
    pub drops: Vec<AggregatedDrop>,
    pub drop_keys_over_limit: u64,
}

/// Evaluate `records` in order on the calling thread.
fn run_inbound(filter: &XdpFilter, records: &[TraceRecord]) -> Tally {
    let mut tally = Tally::default();
    for rec in records {
        let v = filter.evaluate(&rec.frame, rec.at_ns);
        tally.record(v.action, v.reason);
    }
    tally
}

fn run_segment(engine: &Engine, segment: Arc<Vec<TraceRecord>>, workers: usize) -> Result<Tally> {
    if workers <= 1 || segment.len() < workers * 2 {
        return Ok(run_inbound(&engine.filter, &segment));
    }

    let chunk = segment.len().div_ceil(workers);
    let mut handles = Vec::with_capacity(workers);
    for start in (0..segment.len()).step_by(chunk) {
        let end = (start + chunk).min(segment.len());
        let segment = Arc::clone(&segment);
        let filter = XdpFilter::new(Arc::clone(engine.filter.maps()));
        handles.push(thread::spawn(move || run_inbound(&filter, &segment[start..end])));
    }

    let mut tally = Tally::default();
    for h in handles {
        match h.join() {
            Ok(t) => tally.merge(t),
            Err(_) => bail!("replay worker panicked"),
        }
    }
    Ok(tally)
}

/// Replay `records` against `engine`. Drop events are aggregated when the
/// engine was built with an event queue.
///
/// Segments are evaluated inside `block_in_place`, so this needs the
/// multi-threaded runtime.
pub async fn replay(
    engine: &mut Engine,
    records: Vec<TraceRecord>,
    workers: usize,
    aggregate_limit: usize,
    geo_db: &SharedGeoLookup,
) -> Result<ReplayReport> {
    let aggregator = engine.events.take().map(|rx| spawn_aggregator(rx, aggregate_limit));

    let mut tally = Tally::default();
    let mut outbound = 0u64;
    let mut pending: Vec<TraceRecord> = Vec::new();

    for rec in records {
        match rec.direction {
            Direction::Inbound => pending.push(rec),
            Direction::Outbound => {
                if !pending.is_empty() {
                    let segment = Arc::new(std::mem::take(&mut pending));
                    tally.merge(task::block_in_place(|| run_segment(engine, segment, workers))?);
                }
                engine.egress.classify(&rec.frame, rec.at_ns);
                outbound += 1;
            }
        }
    }
    if !pending.is_empty() {
        let segment = Arc::new(pending);
        tally.merge(task::block_in_place(|| run_segment(engine, segment, workers))?);
    }

    let (drops, drop_keys_over_limit) = match aggregator {
        Some((stop, handle)) => {
            let _ = stop.send(());
            let agg = handle.await.context("event aggregator panicked")?;
            let overflow = agg.overflow;
            (agg.into_sorted(geo_db), overflow)
        }
        None => (Vec::new(), 0),
    };

    let stats = &engine.maps.stats;
    Ok(ReplayReport {
        inbound: tally.passed + tally.dropped,
        outbound,
        passed: tally.passed,
        dropped: tally.dropped,
        by_reason: tally
            .by_reason
            .into_iter()
            .map(|(r, n)| (reason_str(r), n))
            .collect(),
        global: stats.snapshot(),
        egress: engine.egress.snapshot(),
        tracked_connections: engine.maps.active_connections.len(),
        top_ports: stats.top_ports(TOP_PORTS_LIMIT),
        drops,
        drop_keys_over_limit,
    })
}

pub async fn replay_file(
    engine: &mut Engine,
    path: &str,
    workers: usize,
    aggregate_limit: usize,
    geo_db: &SharedGeoLookup,
) -> Result<ReplayReport> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read trace file: {}", path))?;
    let records = parse_trace(&content).with_context(|| format!("in {}", path))?;
    log::info!("replaying {} records from {} ({} workers)", records.len(), path, workers.max(1));
    replay(engine, records, workers, aggregate_limit, geo_db).await
}
