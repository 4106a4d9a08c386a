//! Usage ledger repository.
//!
//! Counters are only ever changed with single UPSERT statements so two
//! requests from the same IP cannot lose each other's increments. Period
//! rollover is applied inside the same statement: when the stored anchor is
//! older than the current day (or month), the period counters restart from
//! the new increment.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{day_start, from_millis, month_start, to_millis, UsageLedger};

/// Repository for per-IP usage counters.
pub struct LedgerRepo;

impl LedgerRepo {
    /// Adds `bytes` and `requests` to every period for `ip`.
    pub fn add(
        conn: &Connection,
        ip: &str,
        bytes: i64,
        requests: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let last_request = (requests > 0).then(|| to_millis(now));

        conn.execute(
            "INSERT INTO usage_ledger (
                ip, daily_bytes, daily_requests, monthly_bytes, monthly_requests,
                total_bytes, total_requests, last_request_at, daily_reset_at, monthly_reset_at
             ) VALUES (?1, ?2, ?3, ?2, ?3, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(ip) DO UPDATE SET
                daily_bytes = CASE WHEN daily_reset_at < ?5 THEN ?2 ELSE daily_bytes + ?2 END,
                daily_requests = CASE WHEN daily_reset_at < ?5 THEN ?3 ELSE daily_requests + ?3 END,
                monthly_bytes = CASE WHEN monthly_reset_at < ?6 THEN ?2 ELSE monthly_bytes + ?2 END,
                monthly_requests = CASE WHEN monthly_reset_at < ?6 THEN ?3 ELSE monthly_requests + ?3 END,
                total_bytes = total_bytes + ?2,
                total_requests = total_requests + ?3,
                last_request_at = COALESCE(?4, last_request_at),
                daily_reset_at = MAX(daily_reset_at, ?5),
                monthly_reset_at = MAX(monthly_reset_at, ?6)",
            params![
                ip,
                bytes,
                requests,
                last_request,
                to_millis(day_start(now)),
                to_millis(month_start(now)),
            ],
        )?;

        Ok(())
    }

    /// Zeroes stale period counters for `ip` and advances the anchors.
    pub fn roll_over(conn: &Connection, ip: &str, now: DateTime<Utc>) -> Result<()> {
        let day = to_millis(day_start(now));
        let month = to_millis(month_start(now));

        conn.execute(
            "UPDATE usage_ledger
             SET daily_bytes = 0, daily_requests = 0, daily_reset_at = ?2
             WHERE ip = ?1 AND daily_reset_at < ?2",
            params![ip, day],
        )?;
        conn.execute(
            "UPDATE usage_ledger
             SET monthly_bytes = 0, monthly_requests = 0, monthly_reset_at = ?2
             WHERE ip = ?1 AND monthly_reset_at < ?2",
            params![ip, month],
        )?;

        Ok(())
    }

    /// Reads the ledger for `ip`, applying any pending rollover first.
    pub fn get(conn: &Connection, ip: &str, now: DateTime<Utc>) -> Result<Option<UsageLedger>> {
        Self::roll_over(conn, ip, now)?;

        let ledger = conn
            .query_row(
                "SELECT ip, daily_bytes, daily_requests, monthly_bytes, monthly_requests,
                        total_bytes, total_requests, last_request_at, daily_reset_at, monthly_reset_at
                 FROM usage_ledger WHERE ip = ?1",
                [ip],
                |row| {
                    Ok(UsageLedger {
                        ip: row.get(0)?,
                        daily_bytes: row.get(1)?,
                        daily_requests: row.get(2)?,
                        monthly_bytes: row.get(3)?,
                        monthly_requests: row.get(4)?,
                        total_bytes: row.get(5)?,
                        total_requests: row.get(6)?,
                        last_request_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
                        daily_reset_at: from_millis(row.get(8)?),
                        monthly_reset_at: from_millis(row.get(9)?),
                    })
                },
            )
            .optional()?;

        Ok(ledger)
    }

    /// Current-day bytes for `ip`, zero if none recorded today.
    pub fn daily_bytes(conn: &Connection, ip: &str, now: DateTime<Utc>) -> Result<i64> {
        Ok(Self::get(conn, ip, now)?.map_or(0, |l| l.daily_bytes))
    }

    /// Number of IPs with a ledger row.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM usage_ledger", [], |row| row.get(0))?;
        Ok(count)
    }
}
