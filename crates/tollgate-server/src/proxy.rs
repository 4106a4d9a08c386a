//! Web-proxy and HTTP-proxy passthrough handlers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use tollgate_core::url_codec::{self, has_http_scheme, Decoded, UrlCodecError};
use tollgate_proxy::delivery::{
    apply_cors, rewrite_location, sanitize_response_headers, set_final_url,
};
use tollgate_proxy::{
    classify, rewrite_css, rewrite_hls, rewrite_html, ContentKind, CountingStream,
    RewriteContext, UpstreamRequest, UpstreamResponse,
};

use crate::client::{self, UNKNOWN_IP};
use crate::error::{ApiError, Result};
use crate::middleware::RequestContext;
use crate::state::AppState;

/// Largest request body forwarded upstream.
pub const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

const USAGE_HINT: &str = "Format: /https://target.com";

/// Fallback handler: `/<absolute-url>` through the rewriting proxy.
pub async fn web_proxy(State(state): State<AppState>, req: Request) -> Response {
    proxy_request(state, req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn proxy_request(state: AppState, req: Request) -> Result<Response> {
    let ctx = request_context(&req);
    let raw = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let referer = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok());

    let target = match url_codec::decode(raw, referer) {
        Ok(Decoded::Target(target)) => target,
        Ok(Decoded::Home) | Err(UrlCodecError::NotFound) => {
            return Err(ApiError::NotFound(USAGE_HINT.to_string()))
        }
        Err(UrlCodecError::InvalidTarget(t)) => {
            return Err(ApiError::InvalidTarget(format!("Invalid target URL: {t}")))
        }
    };

    let requested_headers = req
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();

    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut(), requested_headers.as_ref());
        return Ok(response);
    }

    let proxy_base = client::proxy_base(
        req.headers(),
        req.uri(),
        state.config.public_base.as_deref(),
        state.config.trust_proxy,
    );
    let rewrite = RewriteContext::new(&target, &proxy_base)?;
    let is_head = req.method() == Method::HEAD;

    let upstream = fetch_upstream(&state, req, &target).await?;
    let status = upstream.status();
    let kind = classify(upstream.content_type(), &target);
    info!(
        ip = %ctx.ip,
        url = %target,
        status = status.as_u16(),
        kind = ?kind,
        "Proxying"
    );

    let mut headers = sanitize_response_headers(upstream.headers(), kind.is_rewritten());
    if status.is_redirection() {
        rewrite_location(&mut headers, &rewrite);
    }
    set_final_url(&mut headers, &target);
    apply_cors(&mut headers, requested_headers.as_ref());

    if is_head {
        return Ok(build_response(status, headers, Body::empty()));
    }

    if kind.is_streaming() {
        let body = counted_body(&state, &ctx, upstream.into_stream());
        return Ok(build_response(status, headers, body));
    }

    let body = match kind {
        ContentKind::Html => {
            let html = upstream.text().await?;
            match rewrite_html(&html, &rewrite) {
                Ok(rewritten) => Bytes::from(rewritten),
                Err(e) => {
                    warn!(url = %target, error = %e, "HTML rewrite failed, sending original");
                    Bytes::from(html)
                }
            }
        }
        ContentKind::Css => Bytes::from(rewrite_css(&upstream.text().await?, &rewrite)),
        ContentKind::HlsManifest => Bytes::from(rewrite_hls(&upstream.text().await?, &rewrite)),
        _ => upstream.bytes().await?,
    };

    if let Some(content_type) = kind.content_type() {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    if ctx.admission.is_some() {
        state
            .record_traffic(ctx.ip.clone(), ctx.tier(), body.len() as u64)
            .await;
    }

    Ok(build_response(status, headers, Body::from(body)))
}

/// Absolute-form requests from clients using this server as an HTTP proxy.
///
/// The upstream response is relayed as-is: no rewriting, no shim.
pub async fn passthrough(state: AppState, ctx: RequestContext, req: Request) -> Response {
    passthrough_request(state, ctx, req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn passthrough_request(
    state: AppState,
    ctx: RequestContext,
    req: Request,
) -> Result<Response> {
    let target = req.uri().to_string();
    if !has_http_scheme(&target) {
        return Err(ApiError::InvalidTarget(format!(
            "Invalid target URL: {target}"
        )));
    }

    info!(ip = %ctx.ip, method = %req.method(), url = %target, "HTTP proxy request");

    let upstream = fetch_upstream(&state, req, &target).await?;
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in [
        header::CONTENT_ENCODING,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
    ] {
        headers.remove(name);
    }

    let body = counted_body(&state, &ctx, upstream.into_stream());
    Ok(build_response(status, headers, body))
}

fn request_context(req: &Request) -> RequestContext {
    req.extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext {
            ip: UNKNOWN_IP.to_string(),
            admission: None,
        })
}

async fn fetch_upstream(
    state: &AppState,
    req: Request,
    target: &str,
) -> Result<UpstreamResponse> {
    let (parts, body) = req.into_parts();
    let has_body = !matches!(parts.method, Method::GET | Method::HEAD);

    let mut request = UpstreamRequest::new(parts.method, target, parts.headers);
    if has_body {
        let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Could not read request body: {e}")))?;
        if !bytes.is_empty() {
            request = request.with_body(bytes);
        }
    }

    Ok(state.upstream.fetch(request).await?)
}

/// Relays `stream` to the client, charging the bytes once it finishes.
fn counted_body(
    state: &AppState,
    ctx: &RequestContext,
    stream: BoxStream<'static, tollgate_proxy::Result<Bytes>>,
) -> Body {
    let state = state.clone();
    let ip = ctx.ip.clone();
    let tier = ctx.tier();
    let charged = ctx.admission.is_some();

    Body::from_stream(CountingStream::new(stream, move |bytes| {
        debug!(ip = %ip, bytes, "Stream finished");
        if charged {
            state.spawn_record_traffic(ip, tier, bytes);
        }
    }))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
