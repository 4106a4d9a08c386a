//! High-level database interface.
//!
//! Every method takes the connection lock once and, where several tables are
//! touched, wraps the work in an immediate transaction. Callers never see a
//! half-applied admission, deduction, or redemption.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use rusqlite::TransactionBehavior;
use tollgate_core::card::{generate_code, mask_ip, normalize_code, CardError};
use tollgate_core::quota::{
    plan_deduction, Admission, EffectiveLimits, QuotaDenial, QuotaPolicy, Tier, UsageSnapshot,
    RATE_WINDOW_SECS,
};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::{
    CardPreview, CardTerms, NewPackage, SystemStats, TrafficOutcome, UsageLedger, UserPackage,
    UserRecharge,
};
use crate::pool::ConnectionPool;
use crate::repository::{CardsRepo, LedgerRepo, PackagesRepo, RechargesRepo, RequestLogRepo};

/// How long admitted-request rows are kept.
const REQUEST_LOG_RETENTION_HOURS: i64 = 24;

/// Outcome of an admission attempt.
pub type Decision = std::result::Result<Admission, QuotaDenial>;

/// High-level database interface for Tollgate.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "tollgate", "tollgate")
            .ok_or_else(|| StorageError::DataDir("no home directory for this user".into()))?;

        Ok(proj_dirs.data_dir().join("tollgate.db"))
    }

    // === Admission ===

    /// Decides whether `ip` may make a request for `url` and, if so, records
    /// it in the request log and ledger before releasing the lock.
    ///
    /// The trailing-window count is read inside the same transaction that
    /// inserts the new row, so concurrent requests always see each other.
    pub fn admit(
        &self,
        policy: &QuotaPolicy,
        ip: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pruned = RequestLogRepo::prune_before(
            &tx,
            now - Duration::hours(REQUEST_LOG_RETENTION_HOURS),
        )?;
        if pruned > 0 {
            debug!(pruned, "Pruned request log");
        }

        let usage = UsageSnapshot {
            recent_requests: RequestLogRepo::count_since(
                &tx,
                ip,
                now - Duration::seconds(RATE_WINDOW_SECS),
            )?,
            daily_bytes: LedgerRepo::daily_bytes(&tx, ip, now)?,
        };

        PackagesRepo::deactivate_expired(&tx, ip, now)?;
        let packages: Vec<_> = PackagesRepo::active_for_ip(&tx, ip, now)?
            .iter()
            .map(UserPackage::allowance)
            .collect();

        let decision = policy.evaluate(ip, &packages, &usage, now);

        if decision.is_ok() {
            RequestLogRepo::insert(&tx, ip, url, now)?;
            LedgerRepo::add(&tx, ip, 0, 1, now)?;
        }

        tx.commit()?;
        Ok(decision)
    }

    /// Limits that currently govern `ip`, without recording anything.
    pub fn current_limits(
        &self,
        policy: &QuotaPolicy,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<EffectiveLimits> {
        let conn = self.pool.get()?;

        let usage = UsageSnapshot {
            recent_requests: RequestLogRepo::count_since(
                &conn,
                ip,
                now - Duration::seconds(RATE_WINDOW_SECS),
            )?,
            daily_bytes: LedgerRepo::daily_bytes(&conn, ip, now)?,
        };
        let packages: Vec<_> = PackagesRepo::active_for_ip(&conn, ip, now)?
            .iter()
            .map(UserPackage::allowance)
            .collect();

        Ok(policy.limits_for(ip, &packages, &usage, now))
    }

    // === Traffic accounting ===

    /// Attributes `bytes` to the tier that admitted the request.
    ///
    /// Package traffic drains the IP's packages soonest-expiry first in one
    /// transaction; anything no package can absorb lands on the ledger.
    pub fn record_traffic(
        &self,
        ip: &str,
        tier: Tier,
        bytes: i64,
        now: DateTime<Utc>,
    ) -> Result<TrafficOutcome> {
        if bytes <= 0 {
            return Ok(TrafficOutcome::default());
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = if tier == Tier::Package {
            let packages: Vec<_> = PackagesRepo::active_for_ip(&tx, ip, now)?
                .iter()
                .map(UserPackage::allowance)
                .collect();
            let plan = plan_deduction(&packages, bytes, now);

            for (id, amount) in &plan.deductions {
                PackagesRepo::add_used(&tx, *id, *amount)?;
            }
            if plan.overflow > 0 {
                LedgerRepo::add(&tx, ip, plan.overflow, 0, now)?;
            }

            TrafficOutcome {
                package_bytes: bytes - plan.overflow,
                ledger_bytes: plan.overflow,
            }
        } else {
            LedgerRepo::add(&tx, ip, bytes, 0, now)?;
            TrafficOutcome {
                package_bytes: 0,
                ledger_bytes: bytes,
            }
        };

        tx.commit()?;
        debug!(ip, bytes, tier = %tier, "Recorded traffic");
        Ok(outcome)
    }

    // === Usage ===

    /// Ledger for `ip`, zeroed if the IP has never been seen.
    pub fn usage(&self, ip: &str, now: DateTime<Utc>) -> Result<UsageLedger> {
        let conn = self.pool.get()?;
        Ok(LedgerRepo::get(&conn, ip, now)?.unwrap_or_else(|| UsageLedger::empty(ip, now)))
    }

    /// Latest request URLs for `ip`, newest first.
    pub fn recent_requests(&self, ip: &str, limit: i64) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        RequestLogRepo::recent_urls(&conn, ip, limit)
    }

    // === Packages ===

    /// Active packages for `ip`, soonest expiry first.
    pub fn active_packages(&self, ip: &str, now: DateTime<Utc>) -> Result<Vec<UserPackage>> {
        let conn = self.pool.get()?;
        PackagesRepo::deactivate_expired(&conn, ip, now)?;
        PackagesRepo::active_for_ip(&conn, ip, now)
    }

    /// Get a package by ID.
    pub fn get_package(&self, id: i64) -> Result<Option<UserPackage>> {
        let conn = self.pool.get()?;
        PackagesRepo::get_by_id(&conn, id)
    }

    /// Deactivates a package ahead of its expiry.
    pub fn revoke_package(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let revoked = PackagesRepo::deactivate(&conn, id)?;
        if revoked {
            info!(package_id = id, "Revoked package");
        }
        Ok(revoked)
    }

    // === Card keys ===

    /// Mints `count` new unused cards.
    pub fn generate_cards(
        &self,
        count: usize,
        terms: CardTerms,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let mut codes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = generate_code();
            CardsRepo::insert(&tx, &code, terms, None, now)?;
            codes.push(code);
        }

        tx.commit()?;
        info!(
            count,
            bandwidth = terms.bandwidth,
            rate = terms.rate_limit,
            days = terms.valid_days,
            "Generated card keys"
        );
        Ok(codes)
    }

    /// Returns `count` unused cards with these terms, minting only the
    /// shortfall.
    pub fn get_or_generate_cards(
        &self,
        count: usize,
        terms: CardTerms,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let mut codes = CardsRepo::find_unused(&tx, terms, count as i64)?;
        let reused = codes.len();
        while codes.len() < count {
            let code = generate_code();
            CardsRepo::insert(&tx, &code, terms, None, now)?;
            codes.push(code);
        }

        tx.commit()?;
        info!(reused, minted = count - reused, "Prepared card keys");
        Ok(codes)
    }

    /// Adds a card with a caller-chosen code and optional code-level expiry.
    pub fn insert_card(
        &self,
        code: &str,
        terms: CardTerms,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        CardsRepo::insert(&conn, &normalize_code(code), terms, expires_at, now)
    }

    /// Previews a card without changing it.
    pub fn card_info(&self, code: &str, now: DateTime<Utc>) -> Result<CardPreview> {
        let conn = self.pool.get()?;

        let preview = match CardsRepo::get_by_code(&conn, &normalize_code(code))? {
            None => CardPreview::NotFound,
            Some(card) if card.used => CardPreview::Used {
                masked_ip: card.used_by.as_deref().map(mask_ip),
                used_at: card.used_at,
            },
            Some(card) if card.is_expired(now) => CardPreview::Expired,
            Some(card) => CardPreview::Valid(CardTerms {
                bandwidth: card.bandwidth,
                rate_limit: card.rate_limit,
                valid_days: card.valid_days,
            }),
        };

        Ok(preview)
    }

    /// Redeems `code` for `ip`.
    ///
    /// Marking the card used, creating the package, and writing the audit row
    /// commit together or not at all.
    pub fn redeem_card(
        &self,
        ip: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<UserPackage, CardError>> {
        let code = normalize_code(code);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let card = match CardsRepo::get_by_code(&tx, &code)? {
            None => return Ok(Err(CardError::NotFound)),
            Some(card) if card.used => return Ok(Err(CardError::AlreadyUsed)),
            Some(card) if card.is_expired(now) => return Ok(Err(CardError::Expired)),
            Some(card) => card,
        };

        if !CardsRepo::mark_used(&tx, &code, ip, now)? {
            return Ok(Err(CardError::AlreadyUsed));
        }

        let package_id = PackagesRepo::insert(
            &tx,
            &NewPackage {
                ip: ip.to_string(),
                bandwidth_total: card.bandwidth,
                rate_limit: card.rate_limit,
                valid_days: card.valid_days,
                activated_at: now,
                card_code: Some(code.clone()),
            },
        )?;
        RechargesRepo::insert(&tx, ip, card.bandwidth, card.rate_limit, &code, now)?;

        let package = PackagesRepo::get_by_id(&tx, package_id)?
            .ok_or_else(|| StorageError::NotFound(format!("package {package_id}")))?;

        tx.commit()?;
        info!(ip, package_id, "Card redeemed");
        Ok(Ok(package))
    }

    // === Admin ===

    /// Aggregate counts.
    pub fn system_stats(&self, now: DateTime<Utc>) -> Result<SystemStats> {
        let conn = self.pool.get()?;
        let (cards_total, cards_used) = CardsRepo::counts(&conn)?;

        Ok(SystemStats {
            cards_total,
            cards_used,
            users: LedgerRepo::count(&conn)?,
            recharges: RechargesRepo::count(&conn)?,
            active_packages: PackagesRepo::count_active(&conn, now)?,
        })
    }

    /// Newest recharges first.
    pub fn recent_recharges(&self, limit: i64) -> Result<Vec<UserRecharge>> {
        let conn = self.pool.get()?;
        RechargesRepo::recent(&conn, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tollgate_core::{GlobalLimits, IpLimitRegistry, UNLIMITED};

    const GIB: i64 = 1024 * 1024 * 1024;

    fn policy(rate: i64, bytes: i64) -> QuotaPolicy {
        QuotaPolicy {
            global: GlobalLimits {
                max_requests_per_min: rate,
                max_bytes_per_day: bytes,
            },
            overrides: IpLimitRegistry::new(),
            packages_enabled: true,
        }
    }

    fn terms(bandwidth: i64, rate_limit: i64, valid_days: i64) -> CardTerms {
        CardTerms {
            bandwidth,
            rate_limit,
            valid_days,
        }
    }

    fn redeem_new(db: &Database, ip: &str, t: CardTerms, now: DateTime<Utc>) -> UserPackage {
        let code = db.generate_cards(1, t, now).unwrap().remove(0);
        db.redeem_card(ip, &code, now).unwrap().unwrap()
    }

    #[test]
    fn test_daily_quota_scenario() {
        let db = Database::in_memory().unwrap();
        let policy = policy(60, 100);
        let now = Utc::now();
        let ip = "198.51.100.7";

        for bytes in [40, 50] {
            let admission = db.admit(&policy, ip, "https://a.example/", now).unwrap().unwrap();
            db.record_traffic(ip, admission.tier(), bytes, now).unwrap();
        }

        let admission = db.admit(&policy, ip, "https://a.example/big", now).unwrap().unwrap();
        assert_eq!(admission.tier(), Tier::Default);
        db.record_traffic(ip, admission.tier(), 20, now).unwrap();

        let denied = db.admit(&policy, ip, "https://a.example/", now).unwrap();
        assert!(matches!(denied, Err(QuotaDenial::QuotaExceeded { .. })));
        assert_eq!(db.usage(ip, now).unwrap().daily_bytes, 110);
    }

    #[test]
    fn test_denied_requests_not_logged() {
        let db = Database::in_memory().unwrap();
        let policy = policy(2, UNLIMITED);
        let now = Utc::now();

        assert!(db.admit(&policy, "ip", "u", now).unwrap().is_ok());
        assert!(db.admit(&policy, "ip", "u", now).unwrap().is_ok());
        assert_eq!(
            db.admit(&policy, "ip", "u", now).unwrap(),
            Err(QuotaDenial::RateLimitExceeded {
                limit: 2,
                current: 2
            })
        );

        let usage = db.usage("ip", now).unwrap();
        assert_eq!(usage.daily_requests, 2);
        assert_eq!(db.recent_requests("ip", 10).unwrap().len(), 2);

        let later = now + Duration::seconds(61);
        assert!(db.admit(&policy, "ip", "u", later).unwrap().is_ok());
    }

    #[test]
    fn test_concurrent_admissions_exact() {
        let db = Arc::new(Database::in_memory().unwrap());
        let policy = Arc::new(policy(10, UNLIMITED));
        let now = Utc::now();

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let db = Arc::clone(&db);
                let policy = Arc::clone(&policy);
                thread::spawn(move || db.admit(&policy, "burst", "u", now).unwrap().is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_redeem_scenario() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let code = db.generate_cards(1, terms(10 * GIB, 300, 30), now).unwrap().remove(0);

        let package = db
            .redeem_card("203.0.113.5", &code.to_lowercase(), now)
            .unwrap()
            .unwrap();
        assert_eq!(package.bandwidth_total, 10 * GIB);
        assert_eq!(package.bandwidth_used, 0);
        assert_eq!(package.rate_limit, 300);
        assert_eq!(
            package.expires_at.timestamp_millis(),
            (now + Duration::days(30)).timestamp_millis()
        );

        assert_eq!(
            db.redeem_card("203.0.113.6", &code, now).unwrap(),
            Err(CardError::AlreadyUsed)
        );
        assert_eq!(db.recent_recharges(10).unwrap().len(), 1);
        assert_eq!(db.active_packages("203.0.113.6", now).unwrap().len(), 0);
    }

    #[test]
    fn test_redeem_unknown_and_expired() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(
            db.redeem_card("ip", "DOESNOTEXIST", now).unwrap(),
            Err(CardError::NotFound)
        );

        db.insert_card("old", terms(GIB, 60, 7), Some(now - Duration::days(1)), now)
            .unwrap();
        assert_eq!(db.redeem_card("ip", "OLD", now).unwrap(), Err(CardError::Expired));
        assert_eq!(db.card_info("old", now).unwrap(), CardPreview::Expired);
        assert_eq!(db.system_stats(now).unwrap().cards_used, 0);
    }

    #[test]
    fn test_concurrent_redemption_single_winner() {
        let db = Arc::new(Database::in_memory().unwrap());
        let now = Utc::now();
        let code = db.generate_cards(1, terms(GIB, 300, 30), now).unwrap().remove(0);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                let code = code.clone();
                thread::spawn(move || {
                    db.redeem_card(&format!("10.0.0.{i}"), &code, now)
                        .unwrap()
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);

        let stats = db.system_stats(now).unwrap();
        assert_eq!(stats.recharges, 1);
        assert_eq!(stats.active_packages, 1);
    }

    #[test]
    fn test_card_info_masks_ip() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let code = db.generate_cards(1, terms(GIB, 300, 30), now).unwrap().remove(0);

        assert_eq!(
            db.card_info(&code, now).unwrap(),
            CardPreview::Valid(terms(GIB, 300, 30))
        );

        db.redeem_card("192.168.1.100", &code, now).unwrap().unwrap();
        match db.card_info(&code, now).unwrap() {
            CardPreview::Used { masked_ip, used_at } => {
                assert_eq!(masked_ip.as_deref(), Some("192.168.*.**"));
                assert!(used_at.is_some());
            }
            other => panic!("unexpected preview {other:?}"),
        }
    }

    #[test]
    fn test_get_or_generate_reuses() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let t = terms(GIB, 300, 30);

        let first = db.get_or_generate_cards(3, t, now).unwrap();
        let second = db.get_or_generate_cards(5, t, now).unwrap();
        assert_eq!(&second[..3], &first[..]);
        assert_eq!(second.len(), 5);

        let other = db.get_or_generate_cards(2, terms(GIB, 60, 30), now).unwrap();
        assert!(other.iter().all(|c| !second.contains(c)));
        assert_eq!(db.system_stats(now).unwrap().cards_total, 7);
    }

    #[test]
    fn test_package_drain_order() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let ip = "10.9.9.9";

        let long = redeem_new(&db, ip, terms(1000, 300, 30), now);
        let short = redeem_new(&db, ip, terms(100, 300, 3), now);

        let outcome = db.record_traffic(ip, Tier::Package, 250, now).unwrap();
        assert_eq!(outcome.package_bytes, 250);
        assert_eq!(outcome.ledger_bytes, 0);

        assert_eq!(db.get_package(short.id).unwrap().unwrap().bandwidth_used, 100);
        assert_eq!(db.get_package(long.id).unwrap().unwrap().bandwidth_used, 150);
        assert_eq!(db.usage(ip, now).unwrap().daily_bytes, 0);
    }

    #[test]
    fn test_package_overflow_spills_to_ledger() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let ip = "10.9.9.8";
        redeem_new(&db, ip, terms(100, 300, 3), now);

        let outcome = db.record_traffic(ip, Tier::Package, 130, now).unwrap();
        assert_eq!(outcome.package_bytes, 100);
        assert_eq!(outcome.ledger_bytes, 30);
        assert_eq!(db.usage(ip, now).unwrap().daily_bytes, 30);

        let policy = policy(60, 1000);
        let admission = db.admit(&policy, ip, "u", now).unwrap().unwrap();
        assert_eq!(admission.tier(), Tier::Default);
    }

    #[test]
    fn test_unlimited_package_admits_everything() {
        let db = Database::in_memory().unwrap();
        let policy = policy(1, 1);
        let now = Utc::now();
        let ip = "10.7.7.7";
        redeem_new(&db, ip, terms(UNLIMITED, UNLIMITED, 30), now);

        for bytes in [1, 1_000, 10 * GIB] {
            let admission = db.admit(&policy, ip, "u", now).unwrap().unwrap();
            assert_eq!(admission.tier(), Tier::Package);
            db.record_traffic(ip, admission.tier(), bytes, now).unwrap();
        }
    }

    #[test]
    fn test_expired_package_falls_back() {
        let db = Database::in_memory().unwrap();
        let policy = policy(60, 1000);
        let now = Utc::now();
        let ip = "10.6.6.6";
        let pkg = redeem_new(&db, ip, terms(GIB, 600, 1), now);

        let later = now + Duration::days(2);
        let limits = db.current_limits(&policy, ip, later).unwrap();
        assert_eq!(limits.tier, Tier::Default);

        db.admit(&policy, ip, "u", later).unwrap().unwrap();
        assert!(!db.get_package(pkg.id).unwrap().unwrap().active);
    }

    #[test]
    fn test_revoke_package() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let pkg = redeem_new(&db, "ip", terms(GIB, 300, 30), now);

        assert!(db.revoke_package(pkg.id).unwrap());
        assert!(db.active_packages("ip", now).unwrap().is_empty());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tollgate.db");
        let now = Utc::now();

        {
            let db = Database::with_path(&path).unwrap();
            db.record_traffic("ip", Tier::Default, 42, now).unwrap();
        }

        let db = Database::with_path(&path).unwrap();
        assert_eq!(db.usage("ip", now).unwrap().total_bytes, 42);
    }
}
