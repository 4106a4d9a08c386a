//! Card key repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{from_millis, to_millis, CardKey, CardTerms};

const COLUMNS: &str =
    "id, code, bandwidth, rate_limit, valid_days, used, used_by, used_at, expires_at, created_at";

/// Repository for redemption codes.
pub struct CardsRepo;

impl CardsRepo {
    /// Inserts an unused card.
    pub fn insert(
        conn: &Connection,
        code: &str,
        terms: CardTerms,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO card_keys (code, bandwidth, rate_limit, valid_days, used, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                code,
                terms.bandwidth,
                terms.rate_limit,
                terms.valid_days,
                expires_at.map(to_millis),
                to_millis(now),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Looks up a card by its (normalized) code.
    pub fn get_by_code(conn: &Connection, code: &str) -> Result<Option<CardKey>> {
        let card = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM card_keys WHERE code = ?1"),
                [code],
                map_row,
            )
            .optional()?;
        Ok(card)
    }

    /// Up to `limit` unused codes with exactly these terms, oldest first.
    pub fn find_unused(conn: &Connection, terms: CardTerms, limit: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT code FROM card_keys
             WHERE used = 0 AND bandwidth = ?1 AND rate_limit = ?2 AND valid_days = ?3
             ORDER BY id ASC LIMIT ?4",
        )?;
        let codes = stmt
            .query_map(
                params![terms.bandwidth, terms.rate_limit, terms.valid_days, limit],
                |row| row.get(0),
            )?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(codes)
    }

    /// Flips `used` from false to true. Returns false if the card was not
    /// found or had already been used.
    pub fn mark_used(conn: &Connection, code: &str, ip: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE card_keys SET used = 1, used_by = ?2, used_at = ?3
             WHERE code = ?1 AND used = 0",
            params![code, ip, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    /// `(total, used)` card counts.
    pub fn counts(conn: &Connection) -> Result<(i64, i64)> {
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(used), 0) FROM card_keys",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<CardKey> {
    Ok(CardKey {
        id: row.get(0)?,
        code: row.get(1)?,
        bandwidth: row.get(2)?,
        rate_limit: row.get(3)?,
        valid_days: row.get(4)?,
        used: row.get::<_, i64>(5)? != 0,
        used_by: row.get(6)?,
        used_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        expires_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        created_at: from_millis(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    const TERMS: CardTerms = CardTerms {
        bandwidth: 1024,
        rate_limit: 300,
        valid_days: 30,
    };

    #[test]
    fn test_insert_and_lookup() {
        let conn = setup_db();
        let now = Utc::now();
        CardsRepo::insert(&conn, "ABC", TERMS, None, now).unwrap();

        let card = CardsRepo::get_by_code(&conn, "ABC").unwrap().unwrap();
        assert!(!card.used);
        assert_eq!(card.bandwidth, 1024);
        assert!(card.expires_at.is_none());
        assert!(CardsRepo::get_by_code(&conn, "abc").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let conn = setup_db();
        let now = Utc::now();
        CardsRepo::insert(&conn, "ABC", TERMS, None, now).unwrap();
        assert!(CardsRepo::insert(&conn, "ABC", TERMS, None, now).is_err());
    }

    #[test]
    fn test_mark_used_once() {
        let conn = setup_db();
        let now = Utc::now();
        CardsRepo::insert(&conn, "ABC", TERMS, None, now).unwrap();

        assert!(CardsRepo::mark_used(&conn, "ABC", "1.2.3.4", now).unwrap());
        assert!(!CardsRepo::mark_used(&conn, "ABC", "5.6.7.8", now).unwrap());
        assert!(!CardsRepo::mark_used(&conn, "NOPE", "5.6.7.8", now).unwrap());

        let card = CardsRepo::get_by_code(&conn, "ABC").unwrap().unwrap();
        assert_eq!(card.used_by.as_deref(), Some("1.2.3.4"));
        assert_eq!(CardsRepo::counts(&conn).unwrap(), (1, 1));
    }

    #[test]
    fn test_find_unused_matches_terms() {
        let conn = setup_db();
        let now = Utc::now();
        CardsRepo::insert(&conn, "A", TERMS, None, now).unwrap();
        CardsRepo::insert(&conn, "B", TERMS, None, now).unwrap();
        CardsRepo::insert(
            &conn,
            "C",
            CardTerms {
                rate_limit: 60,
                ..TERMS
            },
            None,
            now,
        )
        .unwrap();
        CardsRepo::mark_used(&conn, "A", "ip", now).unwrap();

        assert_eq!(CardsRepo::find_unused(&conn, TERMS, 10).unwrap(), vec!["B"]);
        assert_eq!(CardsRepo::counts(&conn).unwrap(), (3, 1));
    }
}
