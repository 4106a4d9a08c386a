//! Request log repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::to_millis;

/// Repository for admitted-request rows.
pub struct RequestLogRepo;

impl RequestLogRepo {
    /// Records one admitted request.
    pub fn insert(conn: &Connection, ip: &str, url: &str, at: DateTime<Utc>) -> Result<i64> {
        conn.execute(
            "INSERT INTO request_log (ip, url, created_at) VALUES (?1, ?2, ?3)",
            params![ip, url, to_millis(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Requests from `ip` strictly after `since`.
    pub fn count_since(conn: &Connection, ip: &str, since: DateTime<Utc>) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM request_log WHERE ip = ?1 AND created_at > ?2",
            params![ip, to_millis(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Deletes rows older than `before`, returning how many were removed.
    pub fn prune_before(conn: &Connection, before: DateTime<Utc>) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM request_log WHERE created_at < ?1",
            [to_millis(before)],
        )?;
        Ok(deleted)
    }

    /// Most recent URLs requested by `ip`, newest first.
    pub fn recent_urls(conn: &Connection, ip: &str, limit: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT url FROM request_log WHERE ip = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let urls = stmt
            .query_map(params![ip, limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(urls)
    }
}
