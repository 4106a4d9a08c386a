//! Content rewriting.
//!
//! Every URL found in a rewritable body is resolved against the response's
//! own URL and re-encoded through the proxy. URLs that already carry the
//! proxy prefix are left alone, so rewriting an already rewritten body is a
//! no-op.

mod css;
mod hls;
mod html;

pub use css::rewrite_css;
pub use hls::rewrite_hls;
pub use html::rewrite_html;

use tollgate_core::url_codec;
use url::Url;

use crate::error::{ProxyError, Result};

/// Prefixes of references that must never be proxied.
const UNTOUCHED_PREFIXES: &[&str] = &["data:", "#", "mailto:", "javascript:", "blob:"];

/// Where a body came from and where the proxy lives.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    target: Url,
    proxy_base: String,
}

impl RewriteContext {
    /// `target` is the upstream URL of the body; `proxy_base` is the public
    /// proxy origin (for example `https://proxy.example`).
    pub fn new(target: &str, proxy_base: &str) -> Result<Self> {
        let target = Url::parse(target).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        Ok(Self {
            target,
            proxy_base: proxy_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn proxy_base(&self) -> &str {
        &self.proxy_base
    }

    /// Scheme, host and port of the target.
    pub fn target_origin(&self) -> String {
        self.target.origin().ascii_serialization()
    }

    /// Proxy URL for `reference`, or `None` if it should stay as written.
    pub fn rewrite_url(&self, reference: &str) -> Option<String> {
        let reference = reference.trim();
        if reference.is_empty() || self.is_untouched(reference) {
            return None;
        }
        if let Some(embedded) = reference.strip_prefix('/') {
            if url_codec::has_http_scheme(embedded) {
                return Some(url_codec::encode(&self.proxy_base, embedded));
            }
        }

        let resolved = url_codec::resolve(&self.target, reference)?;
        if !url_codec::has_http_scheme(&resolved) {
            return None;
        }
        Some(url_codec::encode(&self.proxy_base, &resolved))
    }

    /// Like [`rewrite_url`](Self::rewrite_url) but falls back to the input.
    pub fn rewrite_or_keep(&self, reference: &str) -> String {
        self.rewrite_url(reference)
            .unwrap_or_else(|| reference.to_string())
    }

    fn is_untouched(&self, reference: &str) -> bool {
        let lower = reference
            .get(..16)
            .unwrap_or(reference)
            .to_ascii_lowercase();
        UNTOUCHED_PREFIXES.iter().any(|p| lower.starts_with(p))
            || url_codec::is_proxied(reference, &self.proxy_base)
    }
}
