use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};

use kgguard_cli::config::{self, BlockFile, BlockRule, KgConfig};
use kgguard_cli::control::{Engine, Now};
use kgguard_cli::format::{describe_block, describe_packet, describe_verdict};
use kgguard_cli::geo::{self, GeoLookup, SharedGeoLookup};
use kgguard_cli::replay::{self, ReplayReport};
use kgguard_common::{block_reason_str, reason_str};
use kgguard_xdp::{parse_cidr, parse_frame};

/// Cap on blacklist entries printed by `block list`
const LIST_LIMIT: usize = 1000;
/// Aggregated drop lines shown in the human report
const REPORT_DROPS: usize = 20;
const REPORT_PORTS: usize = 10;

#[derive(Parser)]
#[clap(
    name = "kgguard",
    about = "kgguard game-server ingress filter",
    long_version = const_format::concatcp!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("KGGUARD_GIT_HASH"), " ", env!("KGGUARD_BUILD_DATE"), ")",
        "\nrustc: ", env!("KGGUARD_RUSTC"),
    ),
)]
struct Opt {
    /// System config (TOML)
    #[clap(short, long, global = true)]
    config: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one hex-encoded frame against the configured tables
    Check {
        /// Frame bytes as hex
        frame: String,
        /// Print JSON
        #[clap(long)]
        json: bool,
    },
    /// Replay a packet trace (`<millis> <in|out> <hex>` per line)
    Replay {
        file: String,
        /// Blocking workers for inbound packets
        #[clap(short, long, default_value_t = 1)]
        workers: usize,
        /// Print JSON
        #[clap(long)]
        json: bool,
    },
    /// Show how the tables classify an address
    Lookup {
        ip: Ipv4Addr,
        /// Print JSON
        #[clap(long)]
        json: bool,
    },
    /// Show config summary and table sizes
    Status,
    /// Manage Allowlist
    Allow {
        #[clap(subcommand)]
        action: AllowAction,
    },
    /// Manage Blocklist
    Block {
        #[clap(subcommand)]
        action: BlockAction,
    },
    /// Generate shell completions
    Completions {
        /// Target shell: bash, zsh, fish, elvish
        #[clap(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AllowAction {
    /// Add IP or CIDR to allowlist
    Add { cidr: String },
    /// Remove IP or CIDR from allowlist
    Remove { cidr: String },
    /// List allowed entries
    List,
}

#[derive(Subcommand)]
enum BlockAction {
    /// Add IP or CIDR to blocklist
    Add {
        cidr: String,
        /// Seconds until the block expires (0 = permanent)
        #[clap(short, long, default_value_t = 0)]
        duration: u64,
        /// manual, rate_limit, geoip, flood
        #[clap(short, long, default_value = "manual")]
        reason: String,
    },
    /// Remove IP or CIDR from blocklist
    Remove { cidr: String },
    /// List blocked entries
    List,
    /// Save current blocklist
    Save {
        #[clap(short, long, default_value = "kgguard.yaml")]
        file: String,
    },
    /// Restore blocklist from file
    Restore {
        #[clap(short, long, default_value = "kgguard.yaml")]
        file: String,
    },
}

fn init_logging(cfg: &config::LoggingConfig) {
    let env = env_logger::Env::default().default_filter_or(cfg.level.as_str());
    let mut builder = env_logger::Builder::from_env(env);
    if cfg.json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    let config_path = opt.config.as_deref();

    // Logging level comes from the config, so report load errors after init
    let (cfg, load_err) = match KgConfig::load_checked(config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (KgConfig::default(), Some(e)),
    };
    init_logging(&cfg.logging);
    if let Some(e) = &load_err {
        log::error!("{:#}; using defaults", e);
    }

    match opt.command {
        Commands::Completions { shell } => {
            let mut cmd = Opt::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
        Commands::Check { frame, json } => handle_check_command(&cfg, &frame, json),
        Commands::Replay { file, workers, json } => {
            handle_replay_command(&cfg, &file, workers, json).await
        }
        Commands::Lookup { ip, json } => handle_lookup_command(&cfg, ip, json),
        Commands::Status => handle_status_command(&cfg, config_path),
        Commands::Allow { action } => {
            if !matches!(action, AllowAction::List) {
                refuse_broken_config(load_err)?;
            }
            handle_allow_command(cfg, config_path, &action)
        }
        Commands::Block { action } => {
            if !matches!(action, BlockAction::List | BlockAction::Save { .. }) {
                refuse_broken_config(load_err)?;
            }
            handle_block_command(cfg, config_path, &action)
        }
    }
}

/// Editing a config that failed to load would overwrite it with defaults.
fn refuse_broken_config(load_err: Option<anyhow::Error>) -> anyhow::Result<()> {
    match load_err {
        Some(e) => Err(e.context("config did not load; fix it before editing")),
        None => Ok(()),
    }
}

fn open_geo(cfg: &KgConfig) -> SharedGeoLookup {
    GeoLookup::open(cfg.geo.database.as_deref()).map(Arc::new)
}

// ============================================================
// CHECK / REPLAY / LOOKUP
// ============================================================

fn handle_check_command(cfg: &KgConfig, frame_hex: &str, json: bool) -> anyhow::Result<()> {
    let frame = hex::decode(frame_hex.trim()).context("frame is not valid hex")?;
    let now = Now::current();
    let engine = Engine::from_config(cfg, now, false)?;
    let verdict = engine.filter.evaluate(&frame, now.engine_ns);
    let parsed = parse_frame(&frame, cfg.link_mode());

    if json {
        let packet = parsed.as_ref().ok().map(|p| {
            serde_json::json!({
                "src_ip": p.src_addr.to_string(),
                "dst_ip": p.dst_addr.to_string(),
                "src_port": p.src_port,
                "dst_port": p.dst_port,
                "proto": p.proto,
                "tcp_flags": p.tcp_flags,
                "fragment": p.is_fragment,
                "len": p.total_len,
            })
        });
        let out = serde_json::json!({
            "action": if verdict.is_drop() { "DROP" } else { "PASS" },
            "action_code": verdict.action.as_u8(),
            "reason": reason_str(verdict.reason),
            "packet": packet,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match &parsed {
        Ok(pkt) => println!("📦 {}", describe_packet(pkt)),
        Err(e) => println!("⚠️  Unparseable frame: {}", e),
    }
    println!("{}", describe_verdict(&verdict));
    Ok(())
}

async fn handle_replay_command(
    cfg: &KgConfig,
    file: &str,
    workers: usize,
    json: bool,
) -> anyhow::Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let geo_db = open_geo(cfg);
    let mut engine = Engine::from_config(cfg, Now::at(0), true)?;
    let report =
        replay::replay_file(&mut engine, file, workers, cfg.events.aggregate_limit, &geo_db).await?;

    if json {
        let out = serde_json::json!({
            "trace": file,
            "report": report,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(r: &ReplayReport) {
    println!("📊 Replay: {} inbound, {} outbound", r.inbound, r.outbound);
    println!("  ✅ passed:  {}", r.passed);
    println!("  ❌ dropped: {}", r.dropped);

    println!("\nVerdicts by reason:");
    for (reason, n) in &r.by_reason {
        println!("  {:<12} {}", reason, n);
    }

    let g = &r.global;
    println!("\nGlobal counters:");
    println!("  packets {}  bytes {}", g.total_packets, g.total_bytes);
    println!(
        "  allowed {}  blocked {}  rate_limited {}  conn_bypass {}  geoip_blocked {}",
        g.allowed, g.blocked, g.rate_limited, g.conn_bypass, g.geoip_blocked
    );
    if g.events_lost > 0 {
        println!("  ⚠️  {} drop events lost", g.events_lost);
    }

    let e = &r.egress;
    println!(
        "\nEgress: {} packets ({} tcp, {} udp), {} tracked, {} peers live",
        e.total, e.tcp, e.udp, e.tracked, r.tracked_connections
    );

    if !r.top_ports.is_empty() {
        println!("\nTop ports:");
        for p in r.top_ports.iter().take(REPORT_PORTS) {
            println!("  {:<6} {} pkts, {} bytes", p.port, p.packets, p.bytes);
        }
    }

    if !r.drops.is_empty() {
        println!("\nDrops by source:");
        for d in r.drops.iter().take(REPORT_DROPS) {
            let cc = d.country.as_deref().unwrap_or("--");
            println!(
                "  🚫 {} [{}] {} x{} (last -> :{}/{})",
                d.src_ip, cc, d.reason, d.count, d.last_dst_port, d.proto
            );
        }
        if r.drops.len() > REPORT_DROPS {
            println!("  ... {} more sources", r.drops.len() - REPORT_DROPS);
        }
    }
    if r.drop_keys_over_limit > 0 {
        println!("  ⚠️  {} events past the aggregation limit", r.drop_keys_over_limit);
    }
}

fn handle_lookup_command(cfg: &KgConfig, ip: Ipv4Addr, json: bool) -> anyhow::Result<()> {
    let now = Now::current();
    let engine = Engine::from_config(cfg, now, false)?;
    let maps = &engine.maps;
    let white = maps.white_list.lookup_prefix(ip).map(|(net, _)| net);
    let blocked = maps.blocked_ips.lookup_blocked(ip, now.engine_ns);
    let geo_allow = maps
        .geo_allowed
        .lookup_prefix(ip)
        .map(|(net, cc)| (net, geo::unpack_country(cc)));
    let geo_db = open_geo(cfg);
    let location = geo_db.as_ref().and_then(|g| g.lookup(ip));

    if json {
        let out = serde_json::json!({
            "ip": ip.to_string(),
            "whitelist": white.map(|n| n.to_string()),
            "blacklist": blocked.as_ref().map(|b| serde_json::json!({
                "network": b.network.to_string(),
                "reason": block_reason_str(b.reason),
                "ttl_secs": b.ttl_secs,
            })),
            "geo_allowed": geo_allow.as_ref().map(|(n, cc)| serde_json::json!({
                "network": n.to_string(),
                "country": cc,
            })),
            "location": location,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("🔍 {}", ip);
    match white {
        Some(net) => println!("  ✅ whitelisted by {}", net),
        None => println!("  ℹ️  not whitelisted"),
    }
    match &blocked {
        Some(info) => println!("  ❌ blocked: {}", describe_block(info)),
        None => println!("  ℹ️  not blocked"),
    }
    match &geo_allow {
        Some((net, cc)) => println!("  🌍 geo-allowed by {} ({})", net, cc),
        None => println!("  ℹ️  outside geo-allowed ranges"),
    }
    if let Some(loc) = location {
        println!("  📍 {} {}", loc.country_code, loc.city);
    }
    Ok(())
}

fn handle_status_command(cfg: &KgConfig, config_path: Option<&str>) -> anyhow::Result<()> {
    let engine = Engine::from_config(cfg, Now::current(), false)?;
    let a = &engine.applied;
    let mc = &engine.maps.config;

    println!("🛡️  kgguard status ({})", KgConfig::path_or_default(config_path));
    println!("  interface:        {} ({:?})", cfg.interface, cfg.link_mode());
    println!("  hard blocking:    {}", mc.hard_blocking());
    println!("  rate limit (pps): {}", mc.rate_limit_pps());
    println!("  maintenance:      {}", mc.maintenance_mode());
    println!("  whitelist:        {}", a.whitelist);
    println!("  blacklist:        {}", a.blacklist);
    println!("  geo prefixes:     {}", a.geo_allowed);
    println!("  allowed ports:    {}", a.allowed_ports);
    if a.skipped > 0 {
        println!("  ⚠️  {} config entries skipped", a.skipped);
    }
    if a.expired > 0 {
        println!("  ⏱️  {} timed blocks already expired", a.expired);
    }
    if a.geo_fail_safe {
        println!("  ⚠️  hard blocking requested without geo data; running soft");
    }
    Ok(())
}

// ============================================================
// ALLOW / BLOCK LIST EDITING
// ============================================================

fn save_config(cfg: &KgConfig, config_path: Option<&str>) -> anyhow::Result<()> {
    match cfg.save(config_path) {
        Ok(()) => {
            println!("💾 Saved {}", KgConfig::path_or_default(config_path));
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Failed to save config: {:#}", e);
            Err(e)
        }
    }
}

/// Entries compare by normalized prefix, so `1.2.3.4` matches `1.2.3.4/32`.
fn same_prefix(entry: &str, net: &str) -> bool {
    parse_cidr(entry).map(|n| n.to_string() == net).unwrap_or(false)
}

fn handle_allow_command(
    mut cfg: KgConfig,
    config_path: Option<&str>,
    action: &AllowAction,
) -> anyhow::Result<()> {
    match action {
        AllowAction::Add { cidr } => {
            let net = parse_cidr(cidr)?.to_string();
            if cfg.allowlist.ips.iter().any(|x| same_prefix(x, &net)) {
                println!("ℹ️  {} already in config allowlist", net);
                return Ok(());
            }
            cfg.allowlist.ips.push(net.clone());
            println!("✅ Added {} to config allowlist", net);
        }
        AllowAction::Remove { cidr } => {
            let net = parse_cidr(cidr)?.to_string();
            let before = cfg.allowlist.ips.len();
            cfg.allowlist.ips.retain(|x| !same_prefix(x, &net));
            if cfg.allowlist.ips.len() == before {
                println!("ℹ️  {} not found in config allowlist", net);
                return Ok(());
            }
            println!("✅ Removed {} from config allowlist", net);
        }
        AllowAction::List => {
            if cfg.allowlist.ips.is_empty() {
                println!("Allowlist is empty.");
            } else {
                println!("Allowed IPs (Config):");
                for ip in &cfg.allowlist.ips {
                    println!("  - {}", ip);
                }
            }
            if cfg.allowlist.include_critical_dns {
                println!("Critical DNS (always allowed):");
                for ip in config::CRITICAL_DNS {
                    println!("  - {}", ip);
                }
            }
            return Ok(());
        }
    }
    save_config(&cfg, config_path)
}

fn handle_block_command(
    mut cfg: KgConfig,
    config_path: Option<&str>,
    action: &BlockAction,
) -> anyhow::Result<()> {
    match action {
        BlockAction::Add { cidr, duration, reason } => {
            let net = parse_cidr(cidr)?.to_string();
            let Some(code) = config::parse_block_reason(reason) else {
                bail!("unknown block reason '{}' (manual, rate_limit, geoip, flood)", reason);
            };
            cfg.blocklist.entries.retain(|r| !same_prefix(&r.cidr, &net));
            cfg.blocklist.entries.push(BlockRule::timed(
                net.clone(),
                block_reason_str(code).to_string(),
                *duration,
                config::unix_now(),
            ));
            if *duration == 0 {
                println!("✅ Blocked {} ({})", net, block_reason_str(code));
            } else {
                println!("✅ Blocked {} ({}) for {}s", net, block_reason_str(code), duration);
            }
        }
        BlockAction::Remove { cidr } => {
            let net = parse_cidr(cidr)?.to_string();
            let before = cfg.blocklist.entries.len();
            cfg.blocklist.entries.retain(|r| !same_prefix(&r.cidr, &net));
            if cfg.blocklist.entries.len() == before {
                println!("ℹ️  {} not found in config blocklist", net);
                return Ok(());
            }
            println!("✅ Unblocked {}", net);
        }
        BlockAction::List => {
            let now = Now::current();
            let engine = Engine::from_config(&cfg, now, false)?;
            let entries = engine.maps.blocked_ips.blocked_entries(LIST_LIMIT, now.engine_ns);
            if entries.is_empty() {
                println!("Blocklist is empty.");
            } else {
                println!("Blocked ranges:");
                for info in &entries {
                    println!("  - {}", describe_block(info));
                }
                if engine.maps.blocked_ips.len() > LIST_LIMIT {
                    println!("  ... showing first {}", LIST_LIMIT);
                }
            }
            return Ok(());
        }
        BlockAction::Save { file } => {
            let out = BlockFile { rules: cfg.blocklist.entries.clone() };
            out.save(file)?;
            println!("💾 Saved {} rules to {}", out.rules.len(), file);
            return Ok(());
        }
        BlockAction::Restore { file } => {
            let restored = BlockFile::load(file)?;
            println!("📂 Restoring {} rules from {}", restored.rules.len(), file);
            let now_unix = config::unix_now();
            let mut rules = Vec::with_capacity(restored.rules.len());
            for rule in restored.rules {
                if parse_cidr(&rule.cidr).is_err() || config::parse_block_reason(&rule.reason).is_none() {
                    println!("⚠️  Skipping invalid rule: {} ({})", rule.cidr, rule.reason);
                } else if rule.remaining_secs(now_unix).is_none() {
                    println!("⏱️  Skipping expired rule: {}", rule.cidr);
                } else {
                    rules.push(rule);
                }
            }
            cfg.blocklist.entries = rules;
        }
    }
    save_config(&cfg, config_path)
}
