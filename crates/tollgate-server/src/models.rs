//! API request and response models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tollgate_core::Tier;

/// Query for `/card-info` and `/recharge`.
#[derive(Debug, Deserialize)]
pub struct CodeQuery {
    pub code: Option<String>,
}

/// Response body for GET /health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

/// Response body for GET /.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub message: String,
    #[serde(rename = "yourIP")]
    pub your_ip: String,
    pub tier: Tier,
    pub daily_quota: DailyQuota,
    /// Present only while the caller holds active packages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<PackageSummary>>,
    pub effective: EffectiveSummary,
    pub endpoints: Endpoints,
    pub statistics: Statistics,
    /// Latest proxied URLs, newest first.
    pub recent_requests: Vec<String>,
}

/// Ledger-governed daily limits.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyQuota {
    pub base: QuotaLine,
    /// Per-IP override, which replaces `base` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<QuotaLine>,
    pub resets_in: String,
}

/// One rate/bandwidth pair with today's usage against it.
#[derive(Debug, Serialize)]
pub struct QuotaLine {
    /// Requests per minute, -1 for unlimited.
    pub rate: i64,
    pub bandwidth: String,
    pub used: String,
    pub remaining: String,
}

/// A package as shown to its owner.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub id: i64,
    pub bandwidth: String,
    pub used: String,
    pub remaining: String,
    pub rate_limit: i64,
    pub valid_days: i64,
    pub expires_at: DateTime<Utc>,
    pub expires_in: String,
    pub card_code: Option<String>,
}

/// Limits in force for the caller's next request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveSummary {
    pub max_rate: i64,
    pub total_bandwidth: String,
}

/// Paths of the other endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub proxy: &'static str,
    pub detect: &'static str,
    pub card_info: &'static str,
    pub recharge: &'static str,
    pub health: &'static str,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            proxy: "/https://example.com",
            detect: "/detect/https://example.com/video",
            card_info: "/card-info?code=YOUR_CARD_CODE",
            recharge: "/recharge?code=YOUR_CARD_CODE",
            health: "/health",
        }
    }
}

/// Cumulative counters.
#[derive(Debug, Serialize)]
pub struct Statistics {
    pub daily: Counter,
    pub monthly: Counter,
    pub total: Counter,
}

#[derive(Debug, Serialize)]
pub struct Counter {
    pub bytes: i64,
    pub formatted: String,
    pub requests: i64,
}

impl Counter {
    pub fn new(bytes: i64, requests: i64) -> Self {
        Self {
            bytes,
            formatted: tollgate_core::format_bandwidth(bytes),
            requests,
        }
    }
}

/// Response body for GET /card-info.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfoResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

/// Response body for a successful GET /recharge.
#[derive(Debug, Serialize)]
pub struct RechargeResponse {
    pub success: bool,
    pub message: &'static str,
    pub package: RechargedPackage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargedPackage {
    pub id: i64,
    pub bandwidth: String,
    pub rate_limit: i64,
    pub valid_days: i64,
    pub expires_at: DateTime<Utc>,
    pub expires_in: String,
}

/// Query for admin endpoints that take only the secret.
#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    pub secret: Option<String>,
}

/// Query for GET {admin}/generate-cards.
///
/// Values stay as strings so `*` and malformed numbers fall back the same
/// way the defaults do.
#[derive(Debug, Deserialize)]
pub struct GenerateCardsQuery {
    pub secret: Option<String>,
    pub count: Option<String>,
    pub bandwidth: Option<String>,
    pub rate: Option<String>,
    pub days: Option<String>,
    /// `true` mints new cards even when matching unused ones exist.
    pub fresh: Option<String>,
}

/// Query for GET {admin}/recharges.
#[derive(Debug, Deserialize)]
pub struct RechargesQuery {
    pub secret: Option<String>,
    /// Maximum number of rows (default: 20).
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// Response body for GET {admin}/stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cards: CardStats,
    pub users: UserStats,
    pub recharges: RechargeStats,
    pub packages: PackageStats,
}

#[derive(Debug, Serialize)]
pub struct CardStats {
    pub total: i64,
    pub used: i64,
    pub unused: i64,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub active: i64,
}

#[derive(Debug, Serialize)]
pub struct RechargeStats {
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct PackageStats {
    pub active: i64,
}

/// Response body for GET {admin}/recharges.
#[derive(Debug, Serialize)]
pub struct RechargesResponse {
    pub recharges: Vec<RechargeEntry>,
}

#[derive(Debug, Serialize)]
pub struct RechargeEntry {
    pub ip: String,
    pub bandwidth: String,
    pub rate: i64,
    pub card: String,
    pub time: DateTime<Utc>,
}

/// Response body for POST {admin}/packages/{id}/revoke.
#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}
