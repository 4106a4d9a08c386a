//! Recharge audit repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{from_millis, to_millis, UserRecharge};

/// Repository for the append-only recharge log.
pub struct RechargesRepo;

impl RechargesRepo {
    pub fn insert(
        conn: &Connection,
        ip: &str,
        bandwidth_added: i64,
        rate_added: i64,
        card_code: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO user_recharges (ip, bandwidth_added, rate_added, card_code, recharged_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ip, bandwidth_added, rate_added, card_code, to_millis(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest recharges first.
    pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<UserRecharge>> {
        let mut stmt = conn.prepare(
            "SELECT id, ip, bandwidth_added, rate_added, card_code, recharged_at
             FROM user_recharges ORDER BY recharged_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(UserRecharge {
                    id: row.get(0)?,
                    ip: row.get(1)?,
                    bandwidth_added: row.get(2)?,
                    rate_added: row.get(3)?,
                    card_code: row.get(4)?,
                    recharged_at: from_millis(row.get(5)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM user_recharges", [], |row| row.get(0))?;
        Ok(count)
    }
}
