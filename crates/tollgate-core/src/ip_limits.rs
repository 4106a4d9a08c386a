//! Per-IP and per-CIDR limit overrides.
//!
//! Entries are written as `IP,requests_per_min,bytes_per_day`, for example
//! `127.0.0.1,1000,10GB` or `10.0.0.0/8,120,*`. The registry is built once at
//! startup and only read afterwards.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::net::{parse_ip, IpPattern};
use crate::quota::UNLIMITED;
use crate::size::{format_bandwidth, parse_limit};

/// Prefix of environment variables holding limit entries.
pub const ENV_PREFIX: &str = "IP_LIMITS";

/// A custom (rate, bandwidth) override for one IP or range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpLimitConfig {
    /// Address or CIDR the override applies to.
    #[serde(serialize_with = "serialize_pattern")]
    pub key: IpPattern,
    /// Requests per minute, or -1 for unlimited.
    pub max_requests_per_min: i64,
    /// Bytes per calendar day, or -1 for unlimited.
    pub max_bytes_per_day: i64,
}

fn serialize_pattern<S>(p: &IpPattern, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.collect_str(p)
}

impl IpLimitConfig {
    /// Parses one `IP,req,bytes` entry.
    pub fn parse_entry(entry: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
        let [ip, req, bytes] = parts.as_slice() else {
            return Err(CoreError::InvalidIpLimit(format!(
                "expected IP,requests_per_min,bytes_per_day but got '{entry}'"
            )));
        };

        let key = IpPattern::parse(ip)?;

        let max_requests_per_min = match *req {
            "*" => UNLIMITED,
            other => other
                .parse::<i64>()
                .map_err(|_| CoreError::InvalidLimit(format!("requests per minute '{other}'")))?,
        };
        if max_requests_per_min <= 0 && max_requests_per_min != UNLIMITED {
            return Err(CoreError::InvalidLimit(format!(
                "requests per minute must be positive or -1, got {max_requests_per_min}"
            )));
        }

        let max_bytes_per_day = parse_limit(bytes)?;
        if max_bytes_per_day == 0 {
            return Err(CoreError::InvalidLimit(format!(
                "bytes per day must be positive or -1, got '{bytes}'"
            )));
        }

        Ok(Self {
            key,
            max_requests_per_min,
            max_bytes_per_day,
        })
    }
}

/// Ordered, immutable set of limit overrides.
#[derive(Debug, Clone, Default)]
pub struct IpLimitRegistry {
    entries: Vec<IpLimitConfig>,
}

impl IpLimitRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from raw entries, skipping (and logging) bad ones.
    ///
    /// Later entries for the same key replace earlier ones in place.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for raw in entries {
            let raw = raw.as_ref();
            if raw.trim().is_empty() {
                continue;
            }
            match IpLimitConfig::parse_entry(raw) {
                Ok(config) => {
                    info!(
                        key = %config.key,
                        rate = config.max_requests_per_min,
                        bandwidth = %format_bandwidth(config.max_bytes_per_day),
                        "Loaded IP limit"
                    );
                    registry.insert(config);
                }
                Err(e) => warn!(entry = raw, error = %e, "Skipping invalid IP limit"),
            }
        }
        registry
    }

    /// Builds a registry from `IP_LIMITS*` variables, in sorted key order.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut matching: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(k, v)| k.starts_with(ENV_PREFIX) && !v.is_empty())
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Self::from_entries(matching.into_iter().map(|(_, v)| v))
    }

    fn insert(&mut self, config: IpLimitConfig) {
        match self.entries.iter_mut().find(|e| e.key == config.key) {
            Some(existing) => *existing = config,
            None => self.entries.push(config),
        }
    }

    /// Finds the override for `ip`: an exact address wins, then the first
    /// matching CIDR in load order.
    pub fn lookup(&self, ip: &IpAddr) -> Option<&IpLimitConfig> {
        self.entries
            .iter()
            .find(|e| !e.key.is_cidr() && e.key.matches(ip))
            .or_else(|| self.entries.iter().find(|e| e.key.is_cidr() && e.key.matches(ip)))
    }

    /// Like [`lookup`](Self::lookup) but takes the textual client IP.
    pub fn lookup_str(&self, ip: &str) -> Option<&IpLimitConfig> {
        parse_ip(ip).and_then(|addr| self.lookup(&addr))
    }

    /// All entries in load order.
    pub fn entries(&self) -> &[IpLimitConfig] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry() {
        let c = IpLimitConfig::parse_entry("127.0.0.1, 1000, 10GB").unwrap();
        assert_eq!(c.key.to_string(), "127.0.0.1");
        assert_eq!(c.max_requests_per_min, 1000);
        assert_eq!(c.max_bytes_per_day, 10 * 1024 * 1024 * 1024);

        let c = IpLimitConfig::parse_entry("10.0.0.0/8,-1,*").unwrap();
        assert_eq!(c.max_requests_per_min, UNLIMITED);
        assert_eq!(c.max_bytes_per_day, UNLIMITED);
    }

    #[test]
    fn test_parse_entry_rejects_bad_input() {
        assert!(IpLimitConfig::parse_entry("127.0.0.1,1000").is_err());
        assert!(IpLimitConfig::parse_entry("127.0.0.1,0,1GB").is_err());
        assert!(IpLimitConfig::parse_entry("127.0.0.1,abc,1GB").is_err());
        assert!(IpLimitConfig::parse_entry("127.0.0.1,10,0").is_err());
        assert!(IpLimitConfig::parse_entry("nope,10,1GB").is_err());
    }

    #[test]
    fn test_exact_match_beats_cidr() {
        let registry = IpLimitRegistry::from_entries([
            "192.168.0.0/16,100,1GB",
            "192.168.1.100,500,5GB",
        ]);
        let hit = registry.lookup_str("192.168.1.100").unwrap();
        assert_eq!(hit.max_requests_per_min, 500);

        let hit = registry.lookup_str("192.168.7.7").unwrap();
        assert_eq!(hit.max_requests_per_min, 100);

        assert!(registry.lookup_str("10.1.1.1").is_none());
    }

    #[test]
    fn test_first_cidr_wins() {
        let registry = IpLimitRegistry::from_entries(["10.0.0.0/8,10,1GB", "10.1.0.0/16,20,2GB"]);
        assert_eq!(registry.lookup_str("10.1.2.3").unwrap().max_requests_per_min, 10);
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let registry = IpLimitRegistry::from_entries(["garbage", "", "1.2.3.4,60,100MB"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_from_vars_sorted_and_filtered() {
        let vars = vec![
            ("IP_LIMITS2".to_string(), "10.2.0.0/16,20,1GB".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("IP_LIMITS1".to_string(), "10.0.0.0/8,10,1GB".to_string()),
            ("IP_LIMITS3".to_string(), String::new()),
        ];
        let registry = IpLimitRegistry::from_vars(vars);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries()[0].key.to_string(), "10.0.0.0/8");
        assert_eq!(registry.lookup_str("10.2.3.4").unwrap().max_requests_per_min, 10);
    }

    #[test]
    fn test_duplicate_key_replaced() {
        let registry = IpLimitRegistry::from_entries(["1.2.3.4,10,1GB", "1.2.3.4,99,1GB"]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup_str("1.2.3.4").unwrap().max_requests_per_min, 99);
    }
}
