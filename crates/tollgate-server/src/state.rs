//! Application state for the server.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use tollgate_core::{Admission, Tier};
use tollgate_proxy::{Detector, UpstreamClient};
use tollgate_storage::Database;

use crate::error::{ApiError, Result};
use crate::{ServerConfig, ServerError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection.
    pub db: Arc<Database>,
    /// Limits, access lists and card defaults.
    pub config: Arc<ServerConfig>,
    /// Client for proxied and passthrough fetches.
    pub upstream: UpstreamClient,
    /// Redirect-following client for `/detect/`.
    pub detector: Detector,
}

impl AppState {
    /// Creates application state around an open database.
    pub fn new(db: Database, config: ServerConfig) -> std::result::Result<Self, ServerError> {
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            upstream: UpstreamClient::new()?,
            detector: Detector::new()?,
        })
    }

    /// Creates application state with an in-memory database.
    pub fn in_memory(config: ServerConfig) -> std::result::Result<Self, ServerError> {
        Self::new(Database::in_memory()?, config)
    }

    /// Runs a database call on the blocking pool.
    pub async fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> tollgate_storage::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ApiError::Internal(format!("database task failed: {e}")))?
            .map_err(ApiError::from)
    }

    /// Admits one request from `ip`, or returns the quota denial.
    pub async fn admit(&self, ip: &str, url: &str) -> Result<Admission> {
        let config = Arc::clone(&self.config);
        let ip = ip.to_string();
        let url = url.to_string();
        let decision = self
            .with_db(move |db| db.admit(&config.policy, &ip, &url, Utc::now()))
            .await?;
        Ok(decision?)
    }

    /// Records `bytes` against the tier that admitted the request.
    ///
    /// Accounting failures are logged; the response has already been sent.
    pub async fn record_traffic(&self, ip: String, tier: Tier, bytes: u64) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        if bytes == 0 {
            return;
        }

        let log_ip = ip.clone();
        match self
            .with_db(move |db| db.record_traffic(&ip, tier, bytes, Utc::now()))
            .await
        {
            Ok(outcome) => debug!(
                ip = %log_ip,
                bytes,
                package_bytes = outcome.package_bytes,
                ledger_bytes = outcome.ledger_bytes,
                "Traffic recorded"
            ),
            Err(e) => error!(ip = %log_ip, bytes, error = %e, "Failed to record traffic"),
        }
    }

    /// Like [`record_traffic`](Self::record_traffic), but returns at once.
    ///
    /// Used from stream completion callbacks, which may run outside a task.
    pub fn spawn_record_traffic(&self, ip: String, tier: Tier, bytes: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = self.clone();
                handle.spawn(async move { state.record_traffic(ip, tier, bytes).await });
            }
            Err(_) => {
                let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
                if let Err(e) = self.db.record_traffic(&ip, tier, bytes, Utc::now()) {
                    error!(ip = %ip, bytes, error = %e, "Failed to record traffic");
                }
            }
        }
    }
}
