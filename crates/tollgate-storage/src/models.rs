//! Data models for storage.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tollgate_core::{PackageAllowance, UNLIMITED};

/// Per-IP traffic counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub ip: String,
    pub daily_bytes: i64,
    pub daily_requests: i64,
    pub monthly_bytes: i64,
    pub monthly_requests: i64,
    pub total_bytes: i64,
    pub total_requests: i64,
    pub last_request_at: Option<DateTime<Utc>>,
    /// Start of the UTC day of the last daily reset.
    pub daily_reset_at: DateTime<Utc>,
    /// Start of the UTC month of the last monthly reset.
    pub monthly_reset_at: DateTime<Utc>,
}

impl UsageLedger {
    /// An untouched ledger for an IP with no history.
    pub fn empty(ip: &str, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.to_string(),
            daily_bytes: 0,
            daily_requests: 0,
            monthly_bytes: 0,
            monthly_requests: 0,
            total_bytes: 0,
            total_requests: 0,
            last_request_at: None,
            daily_reset_at: day_start(now),
            monthly_reset_at: month_start(now),
        }
    }
}

/// A prepaid allowance created by redeeming a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPackage {
    pub id: i64,
    pub ip: String,
    /// Total bytes, or -1 for unlimited.
    pub bandwidth_total: i64,
    pub bandwidth_used: i64,
    /// Requests per minute, or -1 for unlimited.
    pub rate_limit: i64,
    pub valid_days: i64,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub card_code: Option<String>,
    pub active: bool,
}

impl UserPackage {
    /// Bytes left, or -1 for unlimited.
    pub fn remaining(&self) -> i64 {
        if self.bandwidth_total == UNLIMITED {
            UNLIMITED
        } else {
            (self.bandwidth_total - self.bandwidth_used).max(0)
        }
    }

    pub fn allowance(&self) -> PackageAllowance {
        PackageAllowance {
            id: self.id,
            bandwidth_total: self.bandwidth_total,
            bandwidth_used: self.bandwidth_used,
            rate_limit: self.rate_limit,
            expires_at: self.expires_at,
        }
    }
}

/// Data for inserting a package.
#[derive(Debug, Clone)]
pub struct NewPackage {
    pub ip: String,
    pub bandwidth_total: i64,
    pub rate_limit: i64,
    pub valid_days: i64,
    pub activated_at: DateTime<Utc>,
    pub card_code: Option<String>,
}

impl NewPackage {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.activated_at + chrono::Duration::days(self.valid_days)
    }
}

/// A single-use redemption code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardKey {
    pub id: i64,
    pub code: String,
    pub bandwidth: i64,
    pub rate_limit: i64,
    pub valid_days: i64,
    pub used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    /// Optional code-level expiry, independent of the package validity.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CardKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Terms shared by a batch of cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardTerms {
    pub bandwidth: i64,
    pub rate_limit: i64,
    pub valid_days: i64,
}

/// Immutable audit row written on every redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecharge {
    pub id: i64,
    pub ip: String,
    pub bandwidth_added: i64,
    pub rate_added: i64,
    pub card_code: String,
    pub recharged_at: DateTime<Utc>,
}

/// Read-only preview of a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardPreview {
    Valid(CardTerms),
    Used {
        masked_ip: Option<String>,
        used_at: Option<DateTime<Utc>>,
    },
    Expired,
    NotFound,
}

/// Where recorded bytes ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficOutcome {
    pub package_bytes: i64,
    pub ledger_bytes: i64,
}

/// Aggregate counts for the admin stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub cards_total: i64,
    pub cards_used: i64,
    pub users: i64,
    pub recharges: i64,
    pub active_packages: i64,
}

/// Start of the UTC calendar day containing `now`.
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Start of the UTC calendar month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
        .unwrap_or_else(|| day_start(now))
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_starts() {
        let now = at("2026-03-17T15:42:10Z");
        assert_eq!(day_start(now), at("2026-03-17T00:00:00Z"));
        assert_eq!(month_start(now), at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn test_millis_round_trip() {
        let now = at("2026-03-17T15:42:10.123Z");
        assert_eq!(from_millis(to_millis(now)), now);
    }

    #[test]
    fn test_card_expiry() {
        let now = Utc::now();
        let mut card = CardKey {
            id: 1,
            code: "X".into(),
            bandwidth: 1,
            rate_limit: 1,
            valid_days: 1,
            used: false,
            used_by: None,
            used_at: None,
            expires_at: None,
            created_at: now,
        };
        assert!(!card.is_expired(now));
        card.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(card.is_expired(now));
    }
}
