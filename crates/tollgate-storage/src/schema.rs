//! Database schema and migrations.
//!
//! All timestamps are stored as INTEGER milliseconds since the Unix epoch
//! (UTC) so window and period comparisons can happen inside SQL.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StorageError};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        if current_version < 2 {
            migrate_v2(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: usage ledger and request log.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: Usage ledger");

    // One row per client IP; period counters roll over lazily
    conn.execute(
        "CREATE TABLE IF NOT EXISTS usage_ledger (
            ip TEXT PRIMARY KEY,
            daily_bytes INTEGER NOT NULL DEFAULT 0,
            daily_requests INTEGER NOT NULL DEFAULT 0,
            monthly_bytes INTEGER NOT NULL DEFAULT 0,
            monthly_requests INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            total_requests INTEGER NOT NULL DEFAULT 0,
            last_request_at INTEGER,
            daily_reset_at INTEGER NOT NULL,
            monthly_reset_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Admitted requests; source of truth for the trailing rate window
    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            url TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_log_ip_created ON request_log (ip, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_log_created ON request_log (created_at)",
        [],
    )?;

    Ok(())
}

/// Migration to version 2: card keys, packages, recharges.
fn migrate_v2(conn: &Connection) -> Result<()> {
    info!("Applying migration v2: Card keys and packages");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS card_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            bandwidth INTEGER NOT NULL,
            rate_limit INTEGER NOT NULL,
            valid_days INTEGER NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            used_by TEXT,
            used_at INTEGER,
            expires_at INTEGER,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    // getOrGenerate looks up unused cards by their exact terms
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_card_keys_terms
         ON card_keys (used, bandwidth, rate_limit, valid_days)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            bandwidth_total INTEGER NOT NULL,
            bandwidth_used INTEGER NOT NULL DEFAULT 0,
            rate_limit INTEGER NOT NULL,
            valid_days INTEGER NOT NULL,
            activated_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            card_code TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_packages_ip
         ON user_packages (ip, active, expires_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_recharges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            bandwidth_added INTEGER NOT NULL,
            rate_added INTEGER NOT NULL,
            card_code TEXT NOT NULL,
            recharged_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_recharges_time ON user_recharges (recharged_at)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in [
            "usage_ledger",
            "request_log",
            "card_keys",
            "user_packages",
            "user_recharges",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StorageError::Migration(_))
        ));
    }
}
