//! Conversion between proxy request paths and upstream URLs.
//!
//! A proxied resource lives at `{proxy_base}/{absolute upstream url}`. The
//! upstream URL is embedded verbatim, including its own query string and
//! fragment, so no escaping is applied in either direction.

use thiserror::Error;
use url::Url;

/// Result of decoding an inbound request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Absolute upstream URL to fetch.
    Target(String),
    /// The bare proxy root was requested.
    Home,
}

/// Errors produced while decoding a request path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlCodecError {
    /// Path names no upstream and no referer could supply one.
    #[error("no upstream target in path")]
    NotFound,

    /// An upstream target was present but does not parse as a URL.
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
}

/// Returns true if `s` starts with `http://` or `https://` (any case).
pub fn has_http_scheme(s: &str) -> bool {
    let lower = s.get(..8).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Syntactic URL check. No DNS or scheme policy is applied.
pub fn is_valid_url(s: &str) -> bool {
    Url::parse(s).is_ok()
}

/// Builds the proxy URL for `target`.
///
/// `proxy_base` is the proxy origin without a trailing slash; pass an empty
/// string to get an origin-relative path.
pub fn encode(proxy_base: &str, target: &str) -> String {
    format!("{}/{}", proxy_base.trim_end_matches('/'), target)
}

/// Returns true if `url` already points through the proxy.
pub fn is_proxied(url: &str, proxy_base: &str) -> bool {
    let base = proxy_base.trim_end_matches('/');
    !base.is_empty() && url.starts_with(&format!("{base}/"))
}

/// Resolves `reference` against `base`, returning the absolute URL string.
pub fn resolve(base: &Url, reference: &str) -> Option<String> {
    base.join(reference).ok().map(String::from)
}

/// Decodes a request path (path plus query, as received) into a target.
///
/// When the path carries no absolute URL, the `referer` header is consulted:
/// if the referer itself is a proxied page, the path is resolved against
/// that page's upstream origin.
pub fn decode(raw_path: &str, referer: Option<&str>) -> Result<Decoded, UrlCodecError> {
    let stripped = raw_path.strip_prefix('/').unwrap_or(raw_path);

    let target = if has_http_scheme(stripped) {
        Some(stripped.to_string())
    } else {
        referer.and_then(|r| resolve_from_referer(raw_path, r))
    };

    match target {
        Some(t) if is_valid_url(&t) => Ok(Decoded::Target(t)),
        Some(t) => Err(UrlCodecError::InvalidTarget(t)),
        None if stripped.is_empty() => Ok(Decoded::Home),
        None => Err(UrlCodecError::NotFound),
    }
}

fn resolve_from_referer(raw_path: &str, referer: &str) -> Option<String> {
    let referer = Url::parse(referer).ok()?;
    let embedded = referer.path().strip_prefix('/')?;
    if !has_http_scheme(embedded) {
        return None;
    }
    let origin = Url::parse(embedded).ok()?;
    if !origin.has_host() {
        return None;
    }
    let root = Url::parse(&origin.origin().ascii_serialization()).ok()?;
    let path = if raw_path.starts_with('/') {
        raw_path.to_string()
    } else {
        format!("/{raw_path}")
    };
    resolve(&root, &path)
}
