//! Tollgate - rewriting web proxy with tiered quotas and prepaid packages.
//!
//! This binary parses the command line (every flag has an environment
//! twin), sets up logging, opens the database and serves until Ctrl-C or
//! SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tollgate_core::{parse_limit, AccessFilter, GlobalLimits, IpLimitRegistry, QuotaPolicy};
use tollgate_server::{normalize_prefix, Server, ServerConfig};
use tollgate_storage::{CardTerms, Database};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Database path that keeps everything in memory.
const MEMORY_DB: &str = ":memory:";

/// Tollgate - rewriting web proxy with tiered quotas
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = tollgate_server::DEFAULT_HOST)]
    host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = tollgate_server::DEFAULT_PORT)]
    port: u16,

    /// SQLite file, or `:memory:` (default: platform data directory)
    #[arg(long, env = "DATABASE_PATH")]
    db_path: Option<PathBuf>,

    /// Comma list of IPs/CIDRs allowed to connect (`*` for everyone)
    #[arg(long, env = "ALLOWED_IPS", default_value = "127.0.0.1")]
    allowed_ips: String,

    /// Comma list of IPs/CIDRs always refused
    #[arg(long, env = "BLOCKED_IPS", default_value = "")]
    blocked_ips: String,

    /// Global requests per minute (-1 for unlimited)
    #[arg(long, env = "MAX_REQ_PER_MIN", default_value_t = 60, allow_hyphen_values = true)]
    max_req_per_min: i64,

    /// Global bytes per day, e.g. `100MB`, `10GB` or -1
    #[arg(
        long,
        env = "MAX_BYTES_PER_DAY",
        default_value = "100MB",
        value_parser = parse_limit,
        allow_hyphen_values = true
    )]
    max_bytes_per_day: i64,

    /// Per-IP override `IP,req_per_min,bytes_per_day` (repeatable).
    /// When given, `IP_LIMITS*` variables are ignored.
    #[arg(long = "ip-limit", value_name = "ENTRY")]
    ip_limits: Vec<String>,

    /// Enable card keys and the package tier
    #[arg(long, env = "CARD_KEY_ENABLED", default_value_t = true, action = ArgAction::Set)]
    card_key_enabled: bool,

    /// Bandwidth of generated cards when the admin passes none
    #[arg(
        long,
        env = "CARD_KEY_DEFAULT_BANDWIDTH",
        default_value = "10GB",
        value_parser = parse_limit,
        allow_hyphen_values = true
    )]
    card_default_bandwidth: i64,

    /// Rate limit of generated cards
    #[arg(long, env = "CARD_KEY_DEFAULT_RATE", default_value_t = 300, allow_hyphen_values = true)]
    card_default_rate: i64,

    /// Validity of generated cards, in days
    #[arg(long, env = "CARD_KEY_DEFAULT_VALID_DAYS", default_value_t = 30)]
    card_default_days: i64,

    /// Prefix for admin routes
    #[arg(long, env = "ADMIN_API_PREFIX", default_value = tollgate_server::DEFAULT_ADMIN_PREFIX)]
    admin_prefix: String,

    /// Shared admin secret; empty disables the admin API
    #[arg(long, env = "ADMIN_SECRET", default_value = "", hide_env_values = true)]
    admin_secret: String,

    /// Honour X-Real-IP, X-Forwarded-For and X-Forwarded-Proto
    #[arg(long, env = "TRUST_PROXY", default_value_t = true, action = ArgAction::Set)]
    trust_proxy: bool,

    /// Fixed proxy origin for rewritten URLs (default: taken from each request)
    #[arg(long, env = "PUBLIC_BASE_URL")]
    public_base: Option<String>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write daily-rotated log files here
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Per-IP overrides from `--ip-limit`, or the environment.
    fn ip_limits<I>(&self, vars: I) -> IpLimitRegistry
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if self.ip_limits.is_empty() {
            IpLimitRegistry::from_vars(vars)
        } else {
            IpLimitRegistry::from_entries(&self.ip_limits)
        }
    }

    fn server_config<I>(&self, vars: I) -> ServerConfig
    where
        I: IntoIterator<Item = (String, String)>,
    {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            db_path: self
                .db_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            admin_prefix: normalize_prefix(&self.admin_prefix),
            admin_secret: self.admin_secret.clone(),
            trust_proxy: self.trust_proxy,
            public_base: self.public_base.clone().filter(|b| !b.trim().is_empty()),
            card_defaults: CardTerms {
                bandwidth: self.card_default_bandwidth,
                rate_limit: self.card_default_rate,
                valid_days: self.card_default_days,
            },
            access: AccessFilter::from_lists(&self.allowed_ips, &self.blocked_ips),
            policy: QuotaPolicy {
                global: GlobalLimits {
                    max_requests_per_min: self.max_req_per_min,
                    max_bytes_per_day: self.max_bytes_per_day,
                },
                overrides: self.ip_limits(vars),
                packages_enabled: self.card_key_enabled,
            },
        }
    }
}

/// Initialize logging, with an optional daily-rotated file.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tollgate={log_level},tollgate_server={log_level},tollgate_proxy={log_level},\
             tollgate_storage={log_level},tollgate_core={log_level},warn"
        ))
    });

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("tollgate")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

fn open_database(path: Option<&str>) -> anyhow::Result<Database> {
    let db = match path {
        Some(MEMORY_DB) => Database::in_memory(),
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("Failed to open database")
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    let config = args.server_config(std::env::vars());
    tracing::info!(
        host = %config.host,
        port = config.port,
        rate = config.policy.global.max_requests_per_min,
        bandwidth = config.policy.global.max_bytes_per_day,
        overrides = config.policy.overrides.len(),
        packages = config.policy.packages_enabled,
        "Starting Tollgate"
    );
    if config.admin_secret.is_empty() {
        tracing::warn!("ADMIN_SECRET is empty; admin API disabled");
    }

    let db = open_database(config.db_path.as_deref())?;
    let server = Server::with_database(config, db)?;
    server.run_until(shutdown_signal()).await?;

    tracing::info!("Tollgate shut down");
    Ok(())
}
