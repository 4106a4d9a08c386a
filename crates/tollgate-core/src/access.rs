//! Allow-list and blacklist filtering of client addresses.

use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;

use crate::net::{parse_ip, IpPattern};

/// Reason a client was refused before any quota work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    #[error("Your IP ({0}) is blacklisted.")]
    Blacklisted(String),

    #[error("Your IP ({0}) is not allowed to use this proxy.")]
    NotAllowed(String),
}

/// Blacklist-then-allow-list filter.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    allowed: Vec<IpPattern>,
    blocked: Vec<IpPattern>,
    allow_all: bool,
}

impl AccessFilter {
    /// Builds a filter from comma-separated lists.
    ///
    /// `*` in the allow list admits every address. Unparseable entries are
    /// logged and ignored.
    pub fn from_lists(allowed: &str, blocked: &str) -> Self {
        let allow_all = allowed.split(',').any(|e| e.trim() == "*");
        Self {
            allowed: parse_list(allowed),
            blocked: parse_list(blocked),
            allow_all,
        }
    }

    /// Filter that admits everyone and blocks nobody.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    /// Checks a textual client address.
    pub fn check(&self, ip: &str) -> Result<(), AccessDenied> {
        let addr = parse_ip(ip);

        if let Some(addr) = addr {
            if self.is_blocked(&addr) {
                return Err(AccessDenied::Blacklisted(ip.to_string()));
            }
        }

        if self.allow_all {
            return Ok(());
        }

        match addr {
            Some(addr) if self.allowed.iter().any(|p| p.matches(&addr)) => Ok(()),
            _ => Err(AccessDenied::NotAllowed(ip.to_string())),
        }
    }

    fn is_blocked(&self, addr: &IpAddr) -> bool {
        self.blocked.iter().any(|p| p.matches(addr))
    }
}

fn parse_list(list: &str) -> Vec<IpPattern> {
    list.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty() && *e != "*")
        .filter_map(|e| match IpPattern::parse(e) {
            Ok(p) => Some(p),
            Err(err) => {
                warn!(entry = e, error = %err, "Ignoring invalid IP list entry");
                None
            }
        })
        .collect()
}
