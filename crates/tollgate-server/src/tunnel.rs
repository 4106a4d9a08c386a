//! CONNECT handling.

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use tollgate_proxy::tunnel;

use crate::error::ApiError;
use crate::middleware::RequestContext;
use crate::state::AppState;

/// Opens the upstream socket, answers `200 Connection Established`, and
/// relays bytes once hyper hands over the upgraded connection.
///
/// Both directions are charged to the client when the tunnel closes,
/// whether it ended cleanly or with an error.
pub async fn connect(state: AppState, ctx: RequestContext, mut req: Request) -> Response {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return ApiError::InvalidTarget("CONNECT requires host:port".to_string()).into_response();
    };

    let upstream = match tunnel::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(ip = %ctx.ip, authority = %authority, error = %e, "Tunnel connect failed");
            return ApiError::from(e).into_response();
        }
    };
    info!(ip = %ctx.ip, authority = %authority, "Tunnel established");

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(ip = %ctx.ip, error = %e, "CONNECT upgrade failed");
                return;
            }
        };

        let relayed = tunnel::relay(TokioIo::new(upgraded), upstream).await;
        match &relayed.error {
            None => debug!(
                ip = %ctx.ip,
                authority = %authority,
                sent = relayed.sent,
                received = relayed.received,
                "Tunnel closed"
            ),
            Some(e) => debug!(
                ip = %ctx.ip,
                authority = %authority,
                sent = relayed.sent,
                received = relayed.received,
                error = %e,
                "Tunnel aborted"
            ),
        }
        if ctx.admission.is_some() {
            state
                .record_traffic(ctx.ip.clone(), ctx.tier(), relayed.total())
                .await;
        }
    });

    let mut response = Response::new(Body::empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}
