//! Client address and proxy origin resolution.

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, Uri};

use tollgate_core::net::canonical;

/// Reported when neither headers nor the socket identify the client.
pub const UNKNOWN_IP: &str = "0.0.0.0";

/// Resolves the client IP for filtering and accounting.
///
/// With `trust_proxy` on, `X-Real-IP` wins, then the first `X-Forwarded-For`
/// hop; the socket peer is the fallback either way.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = header_str(headers, "x-real-ip") {
            return ip.to_string();
        }
        if let Some(ip) = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return ip.to_string();
        }
    }

    peer.map(|addr| canonical(addr.ip()).to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// The origin clients reach the proxy at, e.g. `https://proxy.example`.
///
/// A configured public base wins; otherwise the origin is rebuilt from the
/// request, honouring `X-Forwarded-Proto`/`-Host` behind a trusted proxy.
pub fn proxy_base(
    headers: &HeaderMap,
    uri: &Uri,
    public_base: Option<&str>,
    trust_proxy: bool,
) -> String {
    if let Some(base) = public_base {
        return base.trim_end_matches('/').to_string();
    }

    let forwarded = |name: &str| {
        if trust_proxy {
            header_str(headers, name)
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        } else {
            None
        }
    };

    let scheme = forwarded("x-forwarded-proto")
        .or(uri.scheme_str())
        .unwrap_or("http");
    let host = forwarded("x-forwarded-host")
        .or_else(|| header_str(headers, header::HOST.as_str()))
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");

    format!("{scheme}://{host}")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
