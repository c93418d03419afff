use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use anyhow::{Context, Result, bail};

use kgguard_common::{
    BLOCK_REASON_FLOOD, BLOCK_REASON_GEOIP, BLOCK_REASON_MANUAL, BLOCK_REASON_RATE_LIMIT,
    MAX_ACTIVE_CONNECTIONS, MAX_BLOCKED_IPS, MAX_GEO_ALLOWED, MAX_IP_STATS, MAX_PORT_STATS,
    MAX_RATE_LIMITS, MAX_WHITE_LIST,
};
use kgguard_xdp::{LinkMode, MapCapacities, DEFAULT_EVENT_QUEUE};

/// Maximum config file size (1 MB) to prevent YAML/TOML bomb attacks
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Public resolvers that stay reachable no matter what the lists say
pub const CRITICAL_DNS: &[&str] = &[
    "108.61.10.10", "9.9.9.9", "8.8.8.8", "8.8.4.4", "1.1.1.1", "1.0.0.1",
];

/// Read a whole file, refusing anything over `MAX_CONFIG_SIZE`.
pub fn read_capped(path: &str) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open config file: {}", path))?;

    let metadata = file.metadata().context("Failed to read file metadata")?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "Config file too large ({} bytes, max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let mut content = String::new();
    BufReader::new(file)
        .take(MAX_CONFIG_SIZE)
        .read_to_string(&mut content)
        .with_context(|| format!("Failed to read {}", path))?;
    Ok(content)
}

// =============================================================================
// BLOCK LIST FILE (YAML): `block save` / `block restore`
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockFile {
    pub rules: Vec<BlockRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRule {
    /// Address or CIDR
    pub cidr: String,
    #[serde(default = "default_reason")]
    pub reason: String, // "manual", "rate_limit", "geoip", "flood"
    /// Absolute expiry in unix seconds, 0 = permanent
    #[serde(default)]
    pub expires_at: u64,
}

impl BlockRule {
    /// Rule blocking `cidr` for `duration_secs` from `now_unix` (0 = permanent).
    pub fn timed(cidr: String, reason: String, duration_secs: u64, now_unix: u64) -> Self {
        let expires_at = if duration_secs == 0 {
            0
        } else {
            now_unix.saturating_add(duration_secs)
        };
        Self { cidr, reason, expires_at }
    }

    /// Seconds left at `now_unix`: `Some(0)` when permanent, `None` once expired.
    pub fn remaining_secs(&self, now_unix: u64) -> Option<u64> {
        match self.expires_at {
            0 => Some(0),
            t if t > now_unix => Some(t - now_unix),
            _ => None,
        }
    }
}

/// Wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

fn default_reason() -> String {
    "manual".to_string()
}

impl BlockFile {
    pub fn load(path: &str) -> Result<Self> {
        let content = read_capped(path)?;
        let file: BlockFile = serde_yaml::from_str(&content).context("Failed to parse YAML block list")?;
        Ok(file)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create block list file: {}", path))?;
        serde_yaml::to_writer(file, self).context("Failed to write YAML block list")?;
        Ok(())
    }
}

pub fn parse_block_reason(reason: &str) -> Option<u32> {
    match reason.to_lowercase().as_str() {
        "" | "manual" | "blacklist" => Some(BLOCK_REASON_MANUAL),
        "rate_limit" | "ratelimit" => Some(BLOCK_REASON_RATE_LIMIT),
        "geoip" | "geoip_violation" => Some(BLOCK_REASON_GEOIP),
        "flood" => Some(BLOCK_REASON_FLOOD),
        _ => None,
    }
}

pub fn proto_to_str(proto: u8) -> String {
    match proto {
        1 => "icmp".to_string(),
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        _ => proto.to_string(),
    }
}

// =============================================================================
// SYSTEM CONFIG (TOML): /etc/kgguard/config.toml
// =============================================================================

pub const DEFAULT_SYSTEM_CONFIG: &str = "/etc/kgguard/config.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct KgConfig {
    pub interface: String,
    pub filter: FilterConfig,
    pub capacity: CapacityConfig,
    pub logging: LoggingConfig,
    pub allowlist: AllowlistConfig,
    pub blocklist: BlocklistConfig,
    pub geo: GeoConfig,
    pub ports: PortsConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceMode {
    /// Raw IP for wg*/tun* interfaces, Ethernet otherwise
    #[default]
    Auto,
    Ethernet,
    RawIp,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub hard_blocking: bool,
    /// 0 disables rate limiting
    pub rate_limit_pps: u32,
    pub maintenance_mode: bool,
    pub interface_mode: InterfaceMode,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CapacityConfig {
    pub white_list: usize,
    pub blocked_ips: usize,
    pub geo_allowed: usize,
    pub active_connections: usize,
    pub rate_limits: usize,
    pub ip_stats: usize,
    pub port_stats: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AllowlistConfig {
    pub ips: Vec<String>,
    pub include_critical_dns: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct BlocklistConfig {
    pub entries: Vec<BlockRule>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct GeoConfig {
    /// Allowed country code -> CIDRs
    pub countries: BTreeMap<String, Vec<String>>,
    /// Extra `CC,CIDR` lines
    pub cidr_file: Option<String>,
    /// GeoLite2 database used to annotate output
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PortsConfig {
    pub allowed: Vec<u16>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_depth: usize,
    /// Distinct (source, reason) keys kept per report
    pub aggregate_limit: usize,
}

impl Default for KgConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".into(),
            filter: FilterConfig::default(),
            capacity: CapacityConfig::default(),
            logging: LoggingConfig::default(),
            allowlist: AllowlistConfig::default(),
            blocklist: BlocklistConfig::default(),
            geo: GeoConfig::default(),
            ports: PortsConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            hard_blocking: false,
            rate_limit_pps: 0,
            maintenance_mode: false,
            interface_mode: InterfaceMode::Auto,
        }
    }
}

impl Default for CapacityConfig {
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self { ips: Vec::new(), include_critical_dns: true }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { queue_depth: DEFAULT_EVENT_QUEUE, aggregate_limit: 50_000 }
    }
}

impl CapacityConfig {
    pub fn to_capacities(&self) -> MapCapacities {
        MapCapacities {
            white_list: self.white_list,
            blocked_ips: self.blocked_ips,
            geo_allowed: self.geo_allowed,
            active_connections: self.active_connections,
            rate_limits: self.rate_limits,
            ip_stats: self.ip_stats,
            port_stats: self.port_stats,
        }
    }
}

impl KgConfig {
    pub fn path_or_default(path: Option<&str>) -> &str {
        path.unwrap_or(DEFAULT_SYSTEM_CONFIG)
    }

    /// Strict load: any error is reported.
    pub fn try_load(path: &str) -> Result<Self> {
        let content = read_capped(path)?;
        toml::from_str(&content).with_context(|| format!("Config parse error in {}", path))
    }

    /// Missing file yields defaults; a broken one is an error.
    pub fn load_checked(path: Option<&str>) -> Result<Self> {
        let config_path = Self::path_or_default(path);
        if !Path::new(config_path).exists() {
            return Ok(Self::default());
        }
        let cfg = Self::try_load(config_path)?;
        log::info!("System config loaded: {}", config_path);
        Ok(cfg)
    }

    /// Lenient load: a missing or broken file yields defaults.
    pub fn load(path: Option<&str>) -> Self {
        Self::load_checked(path).unwrap_or_else(|e| {
            log::error!("{:#}; using defaults", e);
            Self::default()
        })
    }

    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = Self::path_or_default(path);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write {}", config_path))?;
        Ok(())
    }

    pub fn link_mode(&self) -> LinkMode {
        match self.filter.interface_mode {
            InterfaceMode::Ethernet => LinkMode::Ethernet,
            InterfaceMode::RawIp => LinkMode::RawIp,
            InterfaceMode::Auto => {
                if self.interface.starts_with("wg") || self.interface.starts_with("tun") {
                    LinkMode::RawIp
                } else {
                    LinkMode::Ethernet
                }
            }
        }
    }

    /// Configured allowlist plus the critical resolvers when enabled.
    pub fn effective_allowlist(&self) -> Vec<String> {
        let mut ips = self.allowlist.ips.clone();
        if self.allowlist.include_critical_dns {
            ips.extend(CRITICAL_DNS.iter().map(|s| s.to_string()));
        }
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg: KgConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, KgConfig::default());
        assert_eq!(cfg.events.queue_depth, DEFAULT_EVENT_QUEUE);
        assert!(cfg.allowlist.include_critical_dns);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: KgConfig = toml::from_str(
            r#"
            interface = "wg0"

            [filter]
            hard_blocking = true
            rate_limit_pps = 500

            [ports]
            allowed = [27015, 7777]

            [geo.countries]
            KR = ["1.208.0.0/12"]
            "#,
        )
        .unwrap();
        assert!(cfg.filter.hard_blocking);
        assert_eq!(cfg.filter.rate_limit_pps, 500);
        assert!(!cfg.filter.maintenance_mode);
        assert_eq!(cfg.ports.allowed, vec![27015, 7777]);
        assert_eq!(cfg.geo.countries["KR"], vec!["1.208.0.0/12".to_string()]);
        assert_eq!(cfg.capacity.blocked_ips, MAX_BLOCKED_IPS);
        assert_eq!(cfg.link_mode(), LinkMode::RawIp);
    }

    #[test]
    fn explicit_interface_mode_wins() {
        let mut cfg = KgConfig { interface: "tun3".into(), ..Default::default() };
        cfg.filter.interface_mode = InterfaceMode::Ethernet;
        assert_eq!(cfg.link_mode(), LinkMode::Ethernet);

        let cfg: KgConfig = toml::from_str("[filter]\ninterface_mode = \"raw_ip\"").unwrap();
        assert_eq!(cfg.link_mode(), LinkMode::RawIp);
    }

    #[test]
    fn critical_dns_can_be_excluded() {
        let mut cfg = KgConfig::default();
        cfg.allowlist.ips.push("203.0.113.9".into());
        assert_eq!(cfg.effective_allowlist().len(), 1 + CRITICAL_DNS.len());
        cfg.allowlist.include_critical_dns = false;
        assert_eq!(cfg.effective_allowlist(), vec!["203.0.113.9".to_string()]);
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        let mut cfg = KgConfig::default();
        cfg.filter.rate_limit_pps = 250;
        cfg.blocklist.entries.push(BlockRule {
            cidr: "198.51.100.0/24".into(),
            reason: "flood".into(),
            expires_at: 1_900_000_000,
        });
        cfg.save(Some(path)).unwrap();

        assert_eq!(KgConfig::try_load(path).unwrap(), cfg);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[filter\nhard_blocking = maybe").unwrap();
        let path = f.path().to_str().unwrap();
        assert!(KgConfig::try_load(path).is_err());
        assert_eq!(KgConfig::load(Some(path)), KgConfig::default());
        assert!(KgConfig::load_checked(Some(path)).is_err());
    }

    #[test]
    fn missing_file_is_defaults() {
        let cfg = KgConfig::load_checked(Some("/nonexistent/kgguard.toml")).unwrap();
        assert_eq!(cfg, KgConfig::default());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let line = "# padding padding padding padding padding padding padding padding\n";
        for _ in 0..(MAX_CONFIG_SIZE as usize / line.len() + 1) {
            f.write_all(line.as_bytes()).unwrap();
        }
        let err = KgConfig::try_load(f.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn block_file_yaml_defaults() {
        let file: BlockFile = serde_yaml::from_str(
            "rules:\n  - cidr: 203.0.113.0/24\n  - cidr: 198.51.100.7\n    reason: flood\n    expires_at: 1900000000\n",
        )
        .unwrap();
        assert_eq!(file.rules[0].reason, "manual");
        assert_eq!(file.rules[0].expires_at, 0);
        assert_eq!(file.rules[1].expires_at, 1_900_000_000);
        assert_eq!(parse_block_reason(&file.rules[1].reason), Some(BLOCK_REASON_FLOOD));
    }

    #[test]
    fn block_reasons_parse() {
        assert_eq!(parse_block_reason("Manual"), Some(BLOCK_REASON_MANUAL));
        assert_eq!(parse_block_reason("rate_limit"), Some(BLOCK_REASON_RATE_LIMIT));
        assert_eq!(parse_block_reason("geoip_violation"), Some(BLOCK_REASON_GEOIP));
        assert_eq!(parse_block_reason("nope"), None);
    }

    #[test]
    fn timed_rules_carry_absolute_expiry() {
        let now = 1_800_000_000;
        let rule = BlockRule::timed("192.0.2.1/32".into(), "flood".into(), 30, now);
        assert_eq!(rule.expires_at, now + 30);
        assert_eq!(rule.remaining_secs(now + 10), Some(20));
        assert_eq!(rule.remaining_secs(now + 30), None);
        assert_eq!(rule.remaining_secs(now + 3_600), None);

        let permanent = BlockRule::timed("192.0.2.2/32".into(), "manual".into(), 0, now);
        assert_eq!(permanent.expires_at, 0);
        assert_eq!(permanent.remaining_secs(u64::MAX), Some(0));
    }
}
