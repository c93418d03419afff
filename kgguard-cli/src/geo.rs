use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use maxminddb::{self, geoip2};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use kgguard_xdp::parse_cidr;

const GEODB_PATHS: &[&str] = &[
    "/var/lib/kgguard/GeoLite2-City.mmdb",
    "/usr/share/GeoIP/GeoLite2-City.mmdb",     // Debian/Ubuntu default
    "/usr/share/GeoIP2/GeoLite2-City.mmdb",    // Fedora
    "/usr/local/share/GeoIP/GeoLite2-City.mmdb",
    "GeoLite2-City.mmdb",                       // Local dev
];

pub struct GeoLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct GeoResult {
    pub country_code: String,
    pub city: String,
}

impl GeoLookup {
    /// Open `preferred` if given, otherwise the first known path that exists.
    pub fn open(preferred: Option<&str>) -> Option<Self> {
        let candidates = preferred.into_iter().chain(GEODB_PATHS.iter().copied());
        for path in candidates {
            if Path::new(path).exists() {
                match maxminddb::Reader::open_readfile(path) {
                    Ok(reader) => {
                        log::info!("GeoIP database loaded: {}", path);
                        return Some(Self { reader });
                    }
                    Err(e) => {
                        log::warn!("Failed to open {}: {}", path, e);
                    }
                }
            }
        }
        log::debug!("No GeoIP database found; output will not carry country codes");
        None
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<GeoResult> {
        let city: geoip2::City = self.reader.lookup(IpAddr::V4(ip)).ok()?;

        let country_code = city.country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or("??")
            .to_string();

        let city_name = city.city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .unwrap_or(&"")
            .to_string();

        Some(GeoResult { country_code, city: city_name })
    }
}

/// Thread-safe wrapper for optional GeoIP
pub type SharedGeoLookup = Option<Arc<GeoLookup>>;

pub fn country_of(geo: &SharedGeoLookup, ip: Ipv4Addr) -> Option<String> {
    geo.as_ref()?.lookup(ip).map(|r| r.country_code)
}

// =============================================================================
// COUNTRY CIDR DATA (geo-allow table values)
// =============================================================================

/// Two-letter country code packed as `c0 << 8 | c1`, upper-cased.
pub fn pack_country(code: &str) -> Option<u32> {
    let bytes = code.trim().as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
        return None;
    }
    let c0 = bytes[0].to_ascii_uppercase() as u32;
    let c1 = bytes[1].to_ascii_uppercase() as u32;
    Some(c0 << 8 | c1)
}

pub fn unpack_country(packed: u32) -> String {
    let c0 = ((packed >> 8) & 0xFF) as u8;
    let c1 = (packed & 0xFF) as u8;
    if c0.is_ascii_alphabetic() && c1.is_ascii_alphabetic() {
        format!("{}{}", c0 as char, c1 as char)
    } else {
        "??".to_string()
    }
}

/// Parse `CC,CIDR` lines. Blank lines and `#` comments are skipped;
/// malformed lines are logged and skipped.
pub fn parse_country_cidrs(content: &str) -> Vec<(u32, Ipv4Net)> {
    let mut out = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed = line
            .split_once(',')
            .and_then(|(cc, cidr)| Some((pack_country(cc)?, parse_cidr(cidr).ok()?)));
        match parsed {
            Some(entry) => out.push(entry),
            None => log::warn!("geo cidr line {}: skipping '{}'", n + 1, line),
        }
    }
    out
}

/// Country CIDR dumps run far past the config size cap, so no cap here.
pub fn load_country_cidrs(path: &str) -> Result<Vec<(u32, Ipv4Net)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read geo CIDR file: {}", path))?;
    Ok(parse_country_cidrs(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_packing() {
        assert_eq!(pack_country("KR"), Some(0x4B52));
        assert_eq!(pack_country("kr"), Some(0x4B52));
        assert_eq!(pack_country("KOR"), None);
        assert_eq!(pack_country("1A"), None);
        assert_eq!(unpack_country(0x4B52), "KR");
        assert_eq!(unpack_country(0), "??");
    }

    #[test]
    fn cidr_lines() {
        let parsed = parse_country_cidrs(
            "# country,cidr\nKR,1.208.0.0/12\n\nJP, 1.0.16.0/20\nbogus\nUS,2001:db8::/32\n",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], (0x4B52, "1.208.0.0/12".parse().unwrap()));
        assert_eq!(unpack_country(parsed[1].0), "JP");
    }

    #[test]
    fn no_database_no_country() {
        assert_eq!(country_of(&None, Ipv4Addr::new(1, 1, 1, 1)), None);
    }

    #[test]
    fn cidr_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.csv");
        std::fs::write(&path, "DE,5.1.0.0/16\nDE,5.2.0.0/16\n").unwrap();
        let parsed = load_country_cidrs(path.to_str().unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(load_country_cidrs("/nonexistent/geo.csv").is_err());
    }
}
