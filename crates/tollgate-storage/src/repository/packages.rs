//! User package repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::models::{from_millis, to_millis, NewPackage, UserPackage};

const COLUMNS: &str = "id, ip, bandwidth_total, bandwidth_used, rate_limit, valid_days,
                       activated_at, expires_at, card_code, active";

/// Repository for prepaid packages.
pub struct PackagesRepo;

impl PackagesRepo {
    /// Inserts a package and returns its id.
    pub fn insert(conn: &Connection, package: &NewPackage) -> Result<i64> {
        conn.execute(
            "INSERT INTO user_packages (
                ip, bandwidth_total, bandwidth_used, rate_limit, valid_days,
                activated_at, expires_at, card_code, active
             ) VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                package.ip,
                package.bandwidth_total,
                package.rate_limit,
                package.valid_days,
                to_millis(package.activated_at),
                to_millis(package.expires_at()),
                package.card_code,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a package by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<UserPackage>> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM user_packages WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], map_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Active, unexpired packages for `ip`, soonest expiry first.
    pub fn active_for_ip(conn: &Connection, ip: &str, now: DateTime<Utc>) -> Result<Vec<UserPackage>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM user_packages
             WHERE ip = ?1 AND active = 1 AND expires_at > ?2
             ORDER BY expires_at ASC, id ASC"
        ))?;
        let packages = stmt
            .query_map(params![ip, to_millis(now)], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Flags expired packages of `ip` inactive.
    pub fn deactivate_expired(conn: &Connection, ip: &str, now: DateTime<Utc>) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE user_packages SET active = 0
             WHERE ip = ?1 AND active = 1 AND expires_at <= ?2",
            params![ip, to_millis(now)],
        )?;
        Ok(changed)
    }

    /// Revokes one package. Returns false if it was already inactive.
    pub fn deactivate(conn: &Connection, id: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE user_packages SET active = 0 WHERE id = ?1 AND active = 1",
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Adds to a package's used bandwidth.
    pub fn add_used(conn: &Connection, id: i64, bytes: i64) -> Result<()> {
        conn.execute(
            "UPDATE user_packages SET bandwidth_used = bandwidth_used + ?2 WHERE id = ?1",
            params![id, bytes],
        )?;
        Ok(())
    }

    /// Number of active, unexpired packages across all IPs.
    pub fn count_active(conn: &Connection, now: DateTime<Utc>) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM user_packages WHERE active = 1 AND expires_at > ?1",
            [to_millis(now)],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<UserPackage> {
    Ok(UserPackage {
        id: row.get(0)?,
        ip: row.get(1)?,
        bandwidth_total: row.get(2)?,
        bandwidth_used: row.get(3)?,
        rate_limit: row.get(4)?,
        valid_days: row.get(5)?,
        activated_at: from_millis(row.get(6)?),
        expires_at: from_millis(row.get(7)?),
        card_code: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use chrono::Duration;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn new_package(ip: &str, days: i64, activated_at: DateTime<Utc>) -> NewPackage {
        NewPackage {
            ip: ip.to_string(),
            bandwidth_total: 1000,
            rate_limit: 300,
            valid_days: days,
            activated_at,
            card_code: Some("CODE".to_string()),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup_db();
        let now = Utc::now();
        let id = PackagesRepo::insert(&conn, &new_package("a", 30, now)).unwrap();

        let pkg = PackagesRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(pkg.bandwidth_used, 0);
        assert!(pkg.active);
        assert_eq!(
            pkg.expires_at.timestamp_millis(),
            (now + Duration::days(30)).timestamp_millis()
        );
        assert!(PackagesRepo::get_by_id(&conn, id + 1).unwrap().is_none());
    }

    #[test]
    fn test_active_ordering_and_expiry() {
        let conn = setup_db();
        let now = Utc::now();
        let long = PackagesRepo::insert(&conn, &new_package("a", 30, now)).unwrap();
        let short = PackagesRepo::insert(&conn, &new_package("a", 3, now)).unwrap();
        PackagesRepo::insert(&conn, &new_package("a", 1, now - Duration::days(5))).unwrap();
        PackagesRepo::insert(&conn, &new_package("b", 10, now)).unwrap();

        let ids: Vec<i64> = PackagesRepo::active_for_ip(&conn, "a", now)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![short, long]);

        assert_eq!(PackagesRepo::deactivate_expired(&conn, "a", now).unwrap(), 1);
        assert_eq!(PackagesRepo::count_active(&conn, now).unwrap(), 3);
    }

    #[test]
    fn test_add_used_and_revoke() {
        let conn = setup_db();
        let now = Utc::now();
        let id = PackagesRepo::insert(&conn, &new_package("a", 30, now)).unwrap();

        PackagesRepo::add_used(&conn, id, 400).unwrap();
        assert_eq!(PackagesRepo::get_by_id(&conn, id).unwrap().unwrap().remaining(), 600);

        assert!(PackagesRepo::deactivate(&conn, id).unwrap());
        assert!(!PackagesRepo::deactivate(&conn, id).unwrap());
        assert!(PackagesRepo::active_for_ip(&conn, "a", now).unwrap().is_empty());
    }
}
