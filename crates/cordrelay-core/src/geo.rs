//! IP-to-country lookup.
//!
//! Lookups never fail: a malformed address, a miss, or a bad country code
//! all resolve to [`GeoInfo::unknown`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use maxminddb::{Reader, geoip2};
use tracing::{debug, warn};

use crate::config::GeoConfig;
use crate::error::{Error, Result};

/// Country name used when a lookup cannot be resolved.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Flag glyph used when a lookup cannot be resolved.
pub const GENERIC_FLAG: &str = "🏳️";

/// Result of a geolocation lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country_name: String,
    pub flag: String,
}

impl GeoInfo {
    pub fn unknown() -> Self {
        Self {
            country_name: UNKNOWN_COUNTRY.to_string(),
            flag: GENERIC_FLAG.to_string(),
        }
    }
}

/// Resolves a connection address to a country.
pub trait GeoLookup: Send + Sync {
    /// Look up `address`, which may carry a `:port` suffix.
    fn lookup(&self, address: &str) -> GeoInfo;
}

/// Lookup that knows no addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownGeo;

impl GeoLookup for UnknownGeo {
    fn lookup(&self, _address: &str) -> GeoInfo {
        GeoInfo::unknown()
    }
}

/// Parse a connection address into an IP, dropping any port.
///
/// Accepts bare IPv4/IPv6 addresses, `ip:port` and `[v6]:port`.
pub fn parse_address(address: &str) -> Option<IpAddr> {
    let trimmed = address.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    let (host, _port) = trimmed.rsplit_once(':')?;
    host.parse::<IpAddr>().ok()
}

/// Convert a two-letter ISO 3166 code to its regional-indicator flag.
///
/// Returns `None` for anything other than exactly two ASCII letters.
pub fn flag_for_iso(iso: &str) -> Option<String> {
    let iso = iso.trim();
    if iso.len() != 2 || !iso.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    iso.chars()
        .map(|c| {
            let offset = u32::from(c.to_ascii_uppercase()) - u32::from('A');
            char::from_u32(0x1F1E6 + offset)
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Country {
    name: String,
    flag: String,
}

/// Fixed IP → country table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticGeoTable {
    entries: HashMap<IpAddr, Country>,
}

impl StaticGeoTable {
    /// Build the table, skipping entries with an unparseable address or
    /// country code.
    pub fn from_config(config: &GeoConfig) -> Self {
        let mut entries = HashMap::new();
        for (address, entry) in &config.entries {
            let Some(ip) = parse_address(address) else {
                warn!(address = %address, "Ignoring geo entry with invalid address");
                continue;
            };
            let Some(flag) = flag_for_iso(&entry.country_code) else {
                warn!(
                    address = %address,
                    country_code = %entry.country_code,
                    "Ignoring geo entry with invalid country code"
                );
                continue;
            };
            entries.insert(
                ip,
                Country {
                    name: entry.country_name.clone(),
                    flag,
                },
            );
        }
        debug!(entries = entries.len(), "Static geo table loaded");
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLookup for StaticGeoTable {
    fn lookup(&self, address: &str) -> GeoInfo {
        let Some(ip) = parse_address(address) else {
            return GeoInfo::unknown();
        };
        self.entries.get(&ip).map_or_else(GeoInfo::unknown, |c| GeoInfo {
            country_name: if c.name.is_empty() {
                UNKNOWN_COUNTRY.to_string()
            } else {
                c.name.clone()
            },
            flag: c.flag.clone(),
        })
    }
}

/// Lookup backed by a MaxMind country database.
pub struct MaxMindGeo {
    reader: Reader<Vec<u8>>,
}

impl MaxMindGeo {
    /// Read the whole database at `path` into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = Reader::open_readfile(path).map_err(|e| {
            Error::Config(format!(
                "Failed to open GeoIP database {}: {e}",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "GeoIP database opened");
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxMindGeo {
    fn lookup(&self, address: &str) -> GeoInfo {
        let Some(ip) = parse_address(address) else {
            return GeoInfo::unknown();
        };
        let record = match self.reader.lookup::<geoip2::Country<'_>>(ip) {
            Ok(record) => record,
            Err(e) => {
                debug!(%ip, error = %e, "GeoIP lookup failed");
                return GeoInfo::unknown();
            }
        };
        let Some(country) = record.country else {
            return GeoInfo::unknown();
        };

        let country_name = country
            .names
            .as_ref()
            .and_then(|names| names.get("en"))
            .map_or_else(|| UNKNOWN_COUNTRY.to_string(), |name| (*name).to_string());
        let flag = country
            .iso_code
            .and_then(flag_for_iso)
            .unwrap_or_else(|| GENERIC_FLAG.to_string());
        GeoInfo { country_name, flag }
    }
}

/// Build the lookup described by `config`.
///
/// A configured database wins; if it cannot be opened the static table is
/// used instead.
pub fn geo_from_config(config: &GeoConfig) -> Arc<dyn GeoLookup> {
    if let Some(path) = &config.database_path {
        match MaxMindGeo::open(path) {
            Ok(geo) => return Arc::new(geo),
            Err(e) => warn!(error = %e, "Falling back to static geo table"),
        }
    }
    Arc::new(StaticGeoTable::from_config(config))
}
