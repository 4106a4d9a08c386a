//! Request gateway: access filter, admission and dispatch.
//!
//! Runs in front of the router for every request, so CONNECT and
//! absolute-form proxy requests are recognised before path routing.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use tollgate_core::{Admission, Tier};

use crate::client::client_ip;
use crate::error::ApiError;
use crate::state::AppState;
use crate::{proxy, tunnel};

/// Per-request facts established by the gateway.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: String,
    /// `None` for quota-exempt requests.
    pub admission: Option<Admission>,
}

impl RequestContext {
    /// Tier traffic is charged to.
    pub fn tier(&self) -> Tier {
        self.admission.map(|a| a.tier()).unwrap_or(Tier::Default)
    }
}

/// Local endpoints that never count against quota.
pub fn is_system_path(path: &str, admin_prefix: &str) -> bool {
    matches!(path, "/" | "/health" | "/card-info" | "/recharge")
        || path.starts_with("/detect/")
        || path == admin_prefix
        || path
            .strip_prefix(admin_prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Filters, admits and routes one request.
pub async fn gateway(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(req.headers(), peer, state.config.trust_proxy);

    if let Err(denied) = state.config.access.check(&ip) {
        warn!(ip = %ip, "Access denied");
        return ApiError::from(denied).into_response();
    }

    let is_connect = req.method() == Method::CONNECT;
    let is_absolute = !is_connect && req.uri().scheme().is_some();
    let exempt = req.method() == Method::OPTIONS
        || (!is_connect
            && !is_absolute
            && is_system_path(req.uri().path(), &state.config.admin_prefix));

    let admission = if exempt {
        None
    } else {
        let url = req.uri().to_string();
        match state.admit(&ip, &url).await {
            Ok(admission) => {
                debug!(ip = %ip, url = %url, tier = %admission.tier(), "Admitted");
                Some(admission)
            }
            Err(e) => {
                warn!(ip = %ip, url = %url, error = %e, "Request denied");
                return e.into_response();
            }
        }
    };

    let ctx = RequestContext { ip, admission };
    req.extensions_mut().insert(ctx.clone());

    if is_connect {
        tunnel::connect(state, ctx, req).await
    } else if is_absolute {
        proxy::passthrough(state, ctx, req).await
    } else {
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_paths() {
        for path in ["/", "/health", "/card-info", "/recharge", "/detect/https://a.example/"] {
            assert!(is_system_path(path, "/admin"), "{path}");
        }
        assert!(is_system_path("/admin", "/admin"));
        assert!(is_system_path("/admin/stats", "/admin"));

        assert!(!is_system_path("/administrator", "/admin"));
        assert!(!is_system_path("/https://site.example/", "/admin"));
        assert!(!is_system_path("/detect", "/admin"));
    }
}
