//! IP address and CIDR patterns.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{CoreError, Result};

/// A single IP address or a CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpPattern {
    /// Exact address.
    Single(IpAddr),
    /// Network range such as `10.0.0.0/8`.
    Cidr(IpNet),
}

impl IpPattern {
    /// Parses `a.b.c.d`, an IPv6 literal, or a CIDR expression.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('/') {
            s.parse::<IpNet>()
                .map(|net| IpPattern::Cidr(net.trunc()))
                .map_err(|_| CoreError::InvalidIpPattern(s.to_string()))
        } else {
            parse_ip(s)
                .map(IpPattern::Single)
                .ok_or_else(|| CoreError::InvalidIpPattern(s.to_string()))
        }
    }

    /// Returns true if `ip` falls under this pattern.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            IpPattern::Single(addr) => canonical(*addr) == canonical(*ip),
            IpPattern::Cidr(net) => net.contains(&canonical(*ip)),
        }
    }

    /// Returns true for CIDR patterns.
    pub fn is_cidr(&self) -> bool {
        matches!(self, IpPattern::Cidr(_))
    }
}

impl FromStr for IpPattern {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        IpPattern::parse(s)
    }
}

impl fmt::Display for IpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPattern::Single(addr) => write!(f, "{addr}"),
            IpPattern::Cidr(net) => write!(f, "{net}"),
        }
    }
}

/// Parses an address, tolerating the `::ffff:` mapped form of IPv4.
pub fn parse_ip(s: &str) -> Option<IpAddr> {
    s.trim().parse::<IpAddr>().ok().map(canonical)
}

/// Collapses IPv4-mapped IPv6 addresses to plain IPv4.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
