//! Tollgate Storage - SQLite persistence layer.
//!
//! This crate keeps the shared, mutable state of the proxy:
//!
//! - Usage ledger (per-IP daily/monthly/total counters with lazy rollover)
//! - Request log (source of truth for the trailing rate window)
//! - Prepaid packages and the card keys that create them
//! - Recharge audit rows
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use tollgate_core::QuotaPolicy;
//! use tollgate_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! let policy = QuotaPolicy::default();
//!
//! match db.admit(&policy, "203.0.113.7", "https://example.com/", Utc::now()).unwrap() {
//!     Ok(admission) => println!("admitted under {}", admission.tier()),
//!     Err(denial) => println!("denied: {denial}"),
//! }
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, Decision};
pub use error::{Result, StorageError};
pub use models::{
    CardKey, CardPreview, CardTerms, NewPackage, SystemStats, TrafficOutcome, UsageLedger,
    UserPackage, UserRecharge,
};
pub use pool::ConnectionPool;
