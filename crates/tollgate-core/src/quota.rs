//! Tiered rate and bandwidth decisions.
//!
//! The engine owns no state. Callers gather a [`UsageSnapshot`] and the IP's
//! live packages inside one storage transaction, then ask [`evaluate`] whether
//! the request may proceed. Tiers are tried in order:
//!
//! 1. `tier3` - a usable prepaid package
//! 2. `tier2` - a custom per-IP or per-CIDR override
//! 3. `tier1` - the global defaults
//!
//! The first tier that applies supplies both the rate limit and the byte
//! limit. A custom override replaces the global default rather than adding
//! to it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ip_limits::{IpLimitConfig, IpLimitRegistry};

/// Sentinel for "no limit" in rate and bandwidth fields.
pub const UNLIMITED: i64 = -1;

/// Length of the trailing rate-limit window.
pub const RATE_WINDOW_SECS: i64 = 60;

/// Suggested client back-off after a rate denial.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Precedence level that governed a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    #[serde(rename = "tier1")]
    Default,
    #[serde(rename = "tier2")]
    Custom,
    #[serde(rename = "tier3")]
    Package,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Default => "tier1",
            Tier::Custom => "tier2",
            Tier::Package => "tier3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalLimits {
    pub max_requests_per_min: i64,
    pub max_bytes_per_day: i64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_requests_per_min: 60,
            max_bytes_per_day: 100 * 1024 * 1024,
        }
    }
}

/// The parts of a stored package the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageAllowance {
    pub id: i64,
    pub bandwidth_total: i64,
    pub bandwidth_used: i64,
    pub rate_limit: i64,
    pub expires_at: DateTime<Utc>,
}

impl PackageAllowance {
    pub fn is_unlimited(&self) -> bool {
        self.bandwidth_total == UNLIMITED
    }

    /// Bytes left, or [`UNLIMITED`].
    pub fn remaining(&self) -> i64 {
        if self.is_unlimited() {
            UNLIMITED
        } else {
            (self.bandwidth_total - self.bandwidth_used).max(0)
        }
    }

    /// Active, unexpired, and not yet drained.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now && (self.is_unlimited() || self.remaining() > 0)
    }
}

/// Per-IP counters read at decision time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Requests admitted in the trailing window.
    pub recent_requests: i64,
    /// Ledger bytes for the current calendar day.
    pub daily_bytes: i64,
}

/// Limits in force for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveLimits {
    pub tier: Tier,
    pub rate_limit: i64,
    pub byte_limit: i64,
    pub bytes_used: i64,
}

impl EffectiveLimits {
    /// Bytes left under the byte limit, or [`UNLIMITED`].
    pub fn remaining(&self) -> i64 {
        if self.byte_limit == UNLIMITED {
            UNLIMITED
        } else {
            (self.byte_limit - self.bytes_used).max(0)
        }
    }
}

/// A successful admission, remembered for traffic accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limits: EffectiveLimits,
}

impl Admission {
    pub fn tier(&self) -> Tier {
        self.limits.tier
    }
}

/// Reasons the engine refuses a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaDenial {
    #[error("You have exceeded the rate limit ({current}/{limit} requests per minute). Please try again later or recharge.")]
    RateLimitExceeded { limit: i64, current: i64 },

    #[error("{}", quota_message(.tier))]
    QuotaExceeded { limit: i64, used: i64, tier: Tier },
}

fn quota_message(tier: &Tier) -> &'static str {
    match tier {
        Tier::Package => {
            "All your packages have been used up. Please recharge or wait for tomorrow."
        }
        _ => "Daily bandwidth limit reached. Please recharge or wait until tomorrow.",
    }
}

impl QuotaDenial {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaDenial::RateLimitExceeded { .. } => "Rate Limit Exceeded",
            QuotaDenial::QuotaExceeded {
                tier: Tier::Package,
                ..
            } => "Bandwidth Quota Exceeded",
            QuotaDenial::QuotaExceeded { .. } => "Daily Quota Exceeded",
        }
    }
}

/// Picks the tier and limits that govern `usage`.
///
/// `packages` may contain expired or drained entries; they are ignored.
pub fn resolve_limits(
    global: &GlobalLimits,
    custom: Option<&IpLimitConfig>,
    packages: &[PackageAllowance],
    packages_enabled: bool,
    usage: &UsageSnapshot,
    now: DateTime<Utc>,
) -> EffectiveLimits {
    if packages_enabled {
        let usable: Vec<&PackageAllowance> =
            packages.iter().filter(|p| p.is_usable(now)).collect();

        if !usable.is_empty() {
            let rate_limit = if usable.iter().any(|p| p.rate_limit == UNLIMITED) {
                UNLIMITED
            } else {
                usable.iter().map(|p| p.rate_limit).max().unwrap_or(0)
            };

            let (byte_limit, bytes_used) = if usable.iter().any(|p| p.is_unlimited()) {
                (UNLIMITED, usable.iter().map(|p| p.bandwidth_used).sum())
            } else {
                (
                    usable.iter().map(|p| p.bandwidth_total).sum(),
                    usable.iter().map(|p| p.bandwidth_used).sum(),
                )
            };

            return EffectiveLimits {
                tier: Tier::Package,
                rate_limit,
                byte_limit,
                bytes_used,
            };
        }
    }

    match custom {
        Some(c) => EffectiveLimits {
            tier: Tier::Custom,
            rate_limit: c.max_requests_per_min,
            byte_limit: c.max_bytes_per_day,
            bytes_used: usage.daily_bytes,
        },
        None => EffectiveLimits {
            tier: Tier::Default,
            rate_limit: global.max_requests_per_min,
            byte_limit: global.max_bytes_per_day,
            bytes_used: usage.daily_bytes,
        },
    }
}

/// Denies once the trailing-window count has reached the limit.
pub fn check_rate(limits: &EffectiveLimits, recent_requests: i64) -> Result<(), QuotaDenial> {
    if limits.rate_limit == UNLIMITED || recent_requests < limits.rate_limit {
        Ok(())
    } else {
        Err(QuotaDenial::RateLimitExceeded {
            limit: limits.rate_limit,
            current: recent_requests,
        })
    }
}

/// Denies once bytes used are at or over the byte limit.
pub fn check_quota(limits: &EffectiveLimits) -> Result<(), QuotaDenial> {
    if limits.byte_limit == UNLIMITED || limits.bytes_used < limits.byte_limit {
        Ok(())
    } else {
        Err(QuotaDenial::QuotaExceeded {
            limit: limits.byte_limit,
            used: limits.bytes_used,
            tier: limits.tier,
        })
    }
}

/// Resolves limits and applies the rate check, then the byte check.
pub fn evaluate(
    global: &GlobalLimits,
    custom: Option<&IpLimitConfig>,
    packages: &[PackageAllowance],
    packages_enabled: bool,
    usage: &UsageSnapshot,
    now: DateTime<Utc>,
) -> Result<Admission, QuotaDenial> {
    let limits = resolve_limits(global, custom, packages, packages_enabled, usage, now);
    check_rate(&limits, usage.recent_requests)?;
    check_quota(&limits)?;
    Ok(Admission { limits })
}

/// Limits configuration shared by every admission decision.
#[derive(Debug, Clone, Default)]
pub struct QuotaPolicy {
    pub global: GlobalLimits,
    pub overrides: IpLimitRegistry,
    pub packages_enabled: bool,
}

impl QuotaPolicy {
    /// Limits that would govern `ip` right now.
    pub fn limits_for(
        &self,
        ip: &str,
        packages: &[PackageAllowance],
        usage: &UsageSnapshot,
        now: DateTime<Utc>,
    ) -> EffectiveLimits {
        let custom = self.overrides.lookup_str(ip);
        resolve_limits(&self.global, custom, packages, self.packages_enabled, usage, now)
    }

    /// Admit-or-deny for one request from `ip`.
    pub fn evaluate(
        &self,
        ip: &str,
        packages: &[PackageAllowance],
        usage: &UsageSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Admission, QuotaDenial> {
        let custom = self.overrides.lookup_str(ip);
        evaluate(&self.global, custom, packages, self.packages_enabled, usage, now)
    }
}

/// How a transfer is split across packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeductionPlan {
    /// `(package id, bytes)` in drain order.
    pub deductions: Vec<(i64, i64)>,
    /// Bytes no package could absorb.
    pub overflow: i64,
}

/// Splits `bytes` across packages, soonest expiry first.
///
/// Unusable packages are skipped. An unlimited package absorbs everything
/// that reaches it.
pub fn plan_deduction(packages: &[PackageAllowance], bytes: i64, now: DateTime<Utc>) -> DeductionPlan {
    let mut ordered: Vec<&PackageAllowance> = packages.iter().filter(|p| p.is_usable(now)).collect();
    ordered.sort_by_key(|p| (p.expires_at, p.id));

    let mut plan = DeductionPlan::default();
    let mut left = bytes.max(0);

    for pkg in ordered {
        if left == 0 {
            break;
        }
        let take = if pkg.is_unlimited() {
            left
        } else {
            left.min(pkg.remaining())
        };
        if take > 0 {
            plan.deductions.push((pkg.id, take));
            left -= take;
        }
    }

    plan.overflow = left;
    plan
}
