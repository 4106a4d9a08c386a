//! HTTP request handlers for local endpoints.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use tollgate_core::url_codec::{has_http_scheme, is_valid_url};
use tollgate_core::{format_bandwidth, parse_limit, time_until, UNLIMITED};
use tollgate_proxy::{Detection, ProxyError};
use tollgate_storage::models::day_start;
use tollgate_storage::{CardPreview, CardTerms, UserPackage};

use crate::error::{ApiError, Result};
use crate::middleware::RequestContext;
use crate::models::*;
use crate::state::AppState;
use crate::ServerConfig;

/// Recent proxied URLs shown on the status page.
const RECENT_REQUESTS: i64 = 10;

/// Cards minted per batch when `count` is absent.
pub const DEFAULT_CARD_COUNT: usize = 10;

/// Upper bound on one generation batch.
pub const MAX_CARD_COUNT: usize = 1000;

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "tollgate",
    })
}

/// GET / - the caller's tier, quota and usage.
pub async fn status(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<StatusResponse>> {
    let now = Utc::now();
    let config = Arc::clone(&state.config);
    let ip = ctx.ip.clone();

    let (limits, ledger, packages, recent) = state
        .with_db(move |db| {
            Ok((
                db.current_limits(&config.policy, &ip, now)?,
                db.usage(&ip, now)?,
                db.active_packages(&ip, now)?,
                db.recent_requests(&ip, RECENT_REQUESTS)?,
            ))
        })
        .await?;

    let policy = &state.config.policy;
    let global = policy.global;
    let base = quota_line(
        global.max_requests_per_min,
        global.max_bytes_per_day,
        ledger.daily_bytes,
    );
    let custom = policy.overrides.lookup_str(&ctx.ip).map(|c| {
        quota_line(c.max_requests_per_min, c.max_bytes_per_day, ledger.daily_bytes)
    });

    let packages = if packages.is_empty() {
        None
    } else {
        Some(packages.iter().map(|p| package_summary(p, now)).collect())
    };

    Ok(Json(StatusResponse {
        message: format!("Tollgate proxy is running ({} limits apply)", limits.tier),
        your_ip: ctx.ip,
        tier: limits.tier,
        daily_quota: DailyQuota {
            base,
            custom,
            resets_in: time_until(day_start(now) + Duration::days(1), now),
        },
        packages,
        effective: EffectiveSummary {
            max_rate: limits.rate_limit,
            total_bandwidth: format_bandwidth(limits.remaining()),
        },
        endpoints: Endpoints::default(),
        statistics: Statistics {
            daily: Counter::new(ledger.daily_bytes, ledger.daily_requests),
            monthly: Counter::new(ledger.monthly_bytes, ledger.monthly_requests),
            total: Counter::new(ledger.total_bytes, ledger.total_requests),
        },
        recent_requests: recent,
    }))
}

fn quota_line(rate: i64, bandwidth: i64, used: i64) -> QuotaLine {
    let remaining = if bandwidth == UNLIMITED {
        UNLIMITED
    } else {
        (bandwidth - used).max(0)
    };
    QuotaLine {
        rate,
        bandwidth: format_bandwidth(bandwidth),
        used: format_bandwidth(used),
        remaining: format_bandwidth(remaining),
    }
}

fn package_summary(package: &UserPackage, now: chrono::DateTime<Utc>) -> PackageSummary {
    PackageSummary {
        id: package.id,
        bandwidth: format_bandwidth(package.bandwidth_total),
        used: format_bandwidth(package.bandwidth_used),
        remaining: format_bandwidth(package.remaining()),
        rate_limit: package.rate_limit,
        valid_days: package.valid_days,
        expires_at: package.expires_at,
        expires_in: time_until(package.expires_at, now),
        card_code: package.card_code.clone(),
    }
}

fn required_code(query: CodeQuery) -> Result<String> {
    query
        .code
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or(ApiError::CodeRequired)
}

fn ensure_cards_enabled(config: &ServerConfig) -> Result<()> {
    if config.policy.packages_enabled {
        Ok(())
    } else {
        Err(ApiError::NotFound("Card key system is disabled".to_string()))
    }
}

/// GET /card-info?code= - preview a card without redeeming it.
pub async fn card_info(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<CardInfoResponse>> {
    ensure_cards_enabled(&state.config)?;
    let code = required_code(query)?;

    let preview = state
        .with_db(move |db| db.card_info(&code, Utc::now()))
        .await?;

    let body = match preview {
        CardPreview::Valid(terms) => CardInfoResponse {
            valid: true,
            bandwidth: Some(format_bandwidth(terms.bandwidth)),
            rate_limit: Some(terms.rate_limit),
            valid_days: Some(terms.valid_days),
            ..CardInfoResponse::default()
        },
        CardPreview::Used { masked_ip, used_at } => CardInfoResponse {
            error: Some("Card already used"),
            used_by: masked_ip,
            used_at,
            ..CardInfoResponse::default()
        },
        CardPreview::Expired => CardInfoResponse {
            error: Some("Card expired"),
            ..CardInfoResponse::default()
        },
        CardPreview::NotFound => CardInfoResponse {
            error: Some("Card not found"),
            ..CardInfoResponse::default()
        },
    };

    Ok(Json(body))
}

/// GET /recharge?code= - redeem a card for the caller's IP.
pub async fn recharge(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<RechargeResponse>> {
    ensure_cards_enabled(&state.config)?;
    let code = required_code(query)?;
    let now = Utc::now();

    let ip = ctx.ip.clone();
    let outcome = state
        .with_db(move |db| db.redeem_card(&ip, &code, now))
        .await?;

    let package = match outcome {
        Ok(package) => package,
        Err(err) => {
            warn!(ip = %ctx.ip, error = %err, "Card redemption refused");
            return Err(ApiError::Card(err));
        }
    };

    info!(
        ip = %ctx.ip,
        package_id = package.id,
        bandwidth = package.bandwidth_total,
        "Package activated"
    );

    Ok(Json(RechargeResponse {
        success: true,
        message: "Recharged successfully! Package activated.",
        package: RechargedPackage {
            id: package.id,
            bandwidth: format_bandwidth(package.bandwidth_total),
            rate_limit: package.rate_limit,
            valid_days: package.valid_days,
            expires_at: package.expires_at,
            expires_in: format!("{} days", package.valid_days),
        },
    }))
}

/// GET /detect/<absolute-url> - follow redirects and report the media type.
pub async fn detect(State(state): State<AppState>, uri: Uri) -> Result<Json<Detection>> {
    let raw = uri.path_and_query().map(|p| p.as_str()).unwrap_or_default();
    let target = raw.strip_prefix("/detect/").unwrap_or_default();

    if !has_http_scheme(target) || !is_valid_url(target) {
        return Err(ApiError::InvalidUrl);
    }

    match state.detector.detect(target).await {
        Ok(detection) => {
            info!(
                url = %target,
                final_url = %detection.final_url,
                media_type = ?detection.media_type,
                "Stream detected"
            );
            Ok(Json(detection))
        }
        Err(ProxyError::InvalidTarget(_)) => Err(ApiError::InvalidUrl),
        Err(e) => Err(ApiError::Detection {
            message: e.detail(),
            original_url: target.to_string(),
        }),
    }
}

// === Admin ===

/// Compares the supplied secret without an early exit on the first
/// differing byte. An empty configured secret disables admin access.
fn authorize(config: &ServerConfig, secret: Option<&str>) -> Result<()> {
    let expected = config.admin_secret.as_bytes();
    let given = secret.unwrap_or_default().as_bytes();

    if expected.is_empty() || !constant_time_eq(given, expected) {
        warn!("Admin request with invalid secret");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reads an optional numeric parameter. `*` means unlimited; anything
/// unparseable or non-positive falls back to `default`.
fn limit_param(raw: Option<&str>, default: i64) -> i64 {
    match raw.map(str::trim) {
        Some("*") | Some("-1") => UNLIMITED,
        Some(v) => v.parse::<i64>().ok().filter(|n| *n > 0).unwrap_or(default),
        None => default,
    }
}

/// GET {admin}/generate-cards - returns codes as a text attachment.
pub async fn generate_cards(
    State(state): State<AppState>,
    Query(query): Query<GenerateCardsQuery>,
) -> Result<Response> {
    authorize(&state.config, query.secret.as_deref())?;

    let defaults = state.config.card_defaults;
    let count = query
        .count
        .as_deref()
        .and_then(|c| c.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_CARD_COUNT)
        .min(MAX_CARD_COUNT);

    let bandwidth = match query.bandwidth.as_deref().map(str::trim) {
        Some(b) if !b.is_empty() => {
            parse_limit(b).map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
        _ => defaults.bandwidth,
    };

    let terms = CardTerms {
        bandwidth,
        rate_limit: limit_param(query.rate.as_deref(), defaults.rate_limit),
        valid_days: query
            .days
            .as_deref()
            .and_then(|d| d.trim().parse::<i64>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(defaults.valid_days),
    };

    let fresh = matches!(query.fresh.as_deref(), Some("1") | Some("true"));
    let codes = state
        .with_db(move |db| {
            if fresh {
                db.generate_cards(count, terms, Utc::now())
            } else {
                db.get_or_generate_cards(count, terms, Utc::now())
            }
        })
        .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"card-keys.txt\"",
            ),
        ],
        codes.join("\n"),
    )
        .into_response())
}

/// GET {admin}/stats
pub async fn admin_stats(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<StatsResponse>> {
    authorize(&state.config, query.secret.as_deref())?;

    let stats = state.with_db(|db| db.system_stats(Utc::now())).await?;

    Ok(Json(StatsResponse {
        cards: CardStats {
            total: stats.cards_total,
            used: stats.cards_used,
            unused: stats.cards_total - stats.cards_used,
        },
        users: UserStats {
            active: stats.users,
        },
        recharges: RechargeStats {
            total: stats.recharges,
        },
        packages: PackageStats {
            active: stats.active_packages,
        },
    }))
}

/// GET {admin}/recharges?limit=
pub async fn recent_recharges(
    State(state): State<AppState>,
    Query(query): Query<RechargesQuery>,
) -> Result<Json<RechargesResponse>> {
    authorize(&state.config, query.secret.as_deref())?;

    let limit = query.limit.clamp(1, 500);
    let rows = state.with_db(move |db| db.recent_recharges(limit)).await?;

    Ok(Json(RechargesResponse {
        recharges: rows
            .into_iter()
            .map(|r| RechargeEntry {
                ip: r.ip,
                bandwidth: format_bandwidth(r.bandwidth_added),
                rate: r.rate_added,
                card: r.card_code,
                time: r.recharged_at,
            })
            .collect(),
    }))
}

/// POST {admin}/packages/{id}/revoke
pub async fn revoke_package(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<RevokeResponse>> {
    authorize(&state.config, query.secret.as_deref())?;

    let revoked = state
        .with_db(move |db| match db.get_package(id)? {
            Some(_) => db.revoke_package(id).map(Some),
            None => Ok(None),
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Package {id} not found")))?;

    Ok(Json(RevokeResponse { revoked }))
}

