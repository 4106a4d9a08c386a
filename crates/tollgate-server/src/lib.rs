//! Tollgate Server - HTTP surface of the proxy.
//!
//! Every request passes the [`middleware::gateway`] first: access filter,
//! then admission (rate and byte quota), then dispatch. CONNECT and
//! absolute-form requests never reach the router.
//!
//! ## Endpoints
//!
//! - `GET /` - caller's tier, quota and usage
//! - `GET /health` - liveness
//! - `GET /card-info?code=` - preview a card
//! - `GET /recharge?code=` - redeem a card
//! - `GET /detect/<url>` - follow redirects and report the media type
//! - `GET {admin}/generate-cards`, `{admin}/stats`, `{admin}/recharges`
//! - `POST {admin}/packages/{id}/revoke`
//! - `ANY /<absolute-url>` - rewriting web proxy
//! - `ANY http://host/path` - HTTP-proxy passthrough
//! - `CONNECT host:port` - raw tunnel
//!
//! ## Example
//!
//! ```no_run
//! use tollgate_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerConfig::default()).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod client;
pub mod error;
mod handlers;
pub mod middleware;
pub mod models;
mod proxy;
pub mod state;
mod tunnel;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::routing::{get, post};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tower::{Layer, Service};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use tollgate_core::{AccessFilter, QuotaPolicy};
use tollgate_storage::{CardTerms, Database};

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 3001;

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default admin route prefix.
pub const DEFAULT_ADMIN_PREFIX: &str = "/admin";

/// Terms for generated cards when the admin passes none.
pub const DEFAULT_CARD_TERMS: CardTerms = CardTerms {
    bandwidth: 10 * 1024 * 1024 * 1024,
    rate_limit: 300,
    valid_days: 30,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 0.0.0.0).
    pub host: String,
    /// Port to bind to (default: 3001).
    pub port: u16,
    /// Database path (None = in-memory).
    pub db_path: Option<String>,
    /// Prefix for admin routes, with a leading and no trailing slash.
    pub admin_prefix: String,
    /// Shared admin secret. Empty disables the admin API.
    pub admin_secret: String,
    /// Honour `X-Real-IP`, `X-Forwarded-For` and `X-Forwarded-*`.
    pub trust_proxy: bool,
    /// Fixed proxy origin used when rewriting; derived per request if unset.
    pub public_base: Option<String>,
    /// Defaults for admin card generation.
    pub card_defaults: CardTerms,
    /// Allow and block lists.
    pub access: AccessFilter,
    /// Global limits, per-IP overrides and the package switch.
    pub policy: QuotaPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db_path: None,
            admin_prefix: DEFAULT_ADMIN_PREFIX.to_string(),
            admin_secret: String::new(),
            trust_proxy: true,
            public_base: None,
            card_defaults: DEFAULT_CARD_TERMS,
            access: AccessFilter::from_lists("127.0.0.1", ""),
            policy: QuotaPolicy {
                packages_enabled: true,
                ..QuotaPolicy::default()
            },
        }
    }
}

impl ServerConfig {
    /// Creates a config for in-memory testing: loopback bind, every client
    /// allowed.
    pub fn in_memory() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            access: AccessFilter::allow_all(),
            ..Self::default()
        }
    }

    /// Creates a config with a specific database path.
    pub fn with_db_path(path: impl Into<String>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the admin prefix and secret.
    pub fn with_admin(mut self, prefix: &str, secret: impl Into<String>) -> Self {
        self.admin_prefix = normalize_prefix(prefix);
        self.admin_secret = secret.into();
        self
    }

    /// Sets the quota policy.
    pub fn with_policy(mut self, policy: QuotaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the access filter.
    pub fn with_access(mut self, access: AccessFilter) -> Self {
        self.access = access;
        self
    }

    /// Pins the proxy origin used in rewritten URLs.
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = Some(base.into());
        self
    }
}

/// `admin/` and `/admin/` both become `/admin`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_ADMIN_PREFIX.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] tollgate_storage::StorageError),

    /// Upstream client could not be built.
    #[error("proxy error: {0}")]
    Proxy(#[from] tollgate_proxy::ProxyError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the full application: gateway in front of the routes.
pub fn build_router(state: AppState) -> Router {
    let prefix = state.config.admin_prefix.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let routes = Router::new()
        .route("/", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/card-info", get(handlers::card_info))
        .route("/recharge", get(handlers::recharge))
        .route("/detect/{*target}", get(handlers::detect))
        .route(
            &format!("{prefix}/generate-cards"),
            get(handlers::generate_cards),
        )
        .route(&format!("{prefix}/stats"), get(handlers::admin_stats))
        .route(
            &format!("{prefix}/recharges"),
            get(handlers::recent_recharges),
        )
        .route(
            &format!("{prefix}/packages/{{id}}/revoke"),
            post(handlers::revoke_package),
        )
        .layer(cors)
        .fallback(proxy::web_proxy)
        .with_state(state.clone());

    // Wrapping the router itself runs the gateway before path routing.
    let gateway =
        axum::middleware::from_fn_with_state(state, middleware::gateway).layer(routes);
    Router::new().fallback_service(gateway)
}

/// The HTTP server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a new server with the given configuration.
    pub async fn new(config: ServerConfig) -> std::result::Result<Self, ServerError> {
        let db = match config.db_path.as_deref() {
            Some(path) if path != ":memory:" => Database::with_path(path)?,
            _ => Database::in_memory()?,
        };

        Self::with_database(config, db)
    }

    /// Creates a server with an existing database.
    pub fn with_database(
        config: ServerConfig,
        db: Database,
    ) -> std::result::Result<Self, ServerError> {
        Self::with_state(AppState::new(db, config)?)
    }

    /// Creates a server with custom application state.
    pub fn with_state(state: AppState) -> std::result::Result<Self, ServerError> {
        let host: IpAddr = state
            .config
            .host
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;
        let addr = SocketAddr::new(host, state.config.port);

        Ok(Self {
            router: build_router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process ends.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        info!("Starting Tollgate on {}", self.addr);
        let listener = bind(self.addr)?;
        serve(listener, self.router, shutdown).await
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Binds with `SO_REUSEADDR` so restarts don't trip over lingering sockets.
fn bind(addr: SocketAddr) -> std::result::Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::BindError(addr, e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::BindError(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::BindError(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| ServerError::BindError(addr, e))
}

/// Accepts connections until `shutdown` resolves.
///
/// Each connection is served on its own task with upgrades enabled, so
/// CONNECT tunnels can take over the socket. The peer address is attached
/// to every request as [`ConnectInfo`].
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    shutdown: F,
) -> std::result::Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let app = app.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(
                        move |mut req: hyper::Request<Incoming>| {
                            req.extensions_mut().insert(ConnectInfo(peer));
                            let mut app = app.clone();
                            async move { app.call(req).await }
                        },
                    );

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tcp), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    Ok(())
}
