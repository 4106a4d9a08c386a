//! Response delivery: content classification, header hygiene and the
//! byte-counting stream used for traffic accounting.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::rewrite::RewriteContext;

/// How a response body is delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Rewritten HTML with the shim injected.
    Html,
    /// Rewritten stylesheet.
    Css,
    /// Rewritten HLS playlist.
    HlsManifest,
    /// JavaScript, passed through as text.
    Script,
    /// JSON, passed through as text.
    Json,
    /// Media relayed chunk by chunk without buffering.
    Stream,
    /// Anything else, buffered whole.
    Buffered,
}

impl ContentKind {
    /// True for kinds whose body is rewritten.
    pub fn is_rewritten(self) -> bool {
        matches!(self, Self::Html | Self::Css | Self::HlsManifest)
    }

    pub fn is_streaming(self) -> bool {
        self == Self::Stream
    }

    /// Content type sent for rewritten or text bodies.
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            Self::Html => Some("text/html; charset=utf-8"),
            Self::Css => Some("text/css; charset=utf-8"),
            Self::HlsManifest => Some("application/vnd.apple.mpegurl"),
            Self::Script => Some("application/javascript; charset=utf-8"),
            Self::Json => Some("application/json; charset=utf-8"),
            Self::Stream | Self::Buffered => None,
        }
    }
}

/// Input to the classifier: lower-cased content type and URL path.
struct Probe {
    content_type: String,
    path: String,
}

impl Probe {
    fn new(content_type: &str, url: &str) -> Self {
        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or(url).to_string());
        Self {
            content_type: content_type.to_ascii_lowercase(),
            path: path.to_ascii_lowercase(),
        }
    }

    fn ct(&self, needle: &str) -> bool {
        self.content_type.contains(needle)
    }

    fn ext(&self, extensions: &[&str]) -> bool {
        extensions.iter().any(|e| self.path.ends_with(e))
    }
}

const MEDIA_EXTENSIONS: &[&str] = &[".m3u8", ".ts", ".flv", ".mp4", ".m4s", ".mpd"];

struct Rule {
    name: &'static str,
    matches: fn(&Probe) -> bool,
    kind: ContentKind,
}

/// Ordered; the first matching rule decides.
const RULES: &[Rule] = &[
    Rule {
        name: "hls-url",
        matches: |p| p.ext(&[".m3u8"]),
        kind: ContentKind::HlsManifest,
    },
    Rule {
        name: "hls-type",
        matches: |p| p.ct("mpegurl") || p.ct("m3u8"),
        kind: ContentKind::HlsManifest,
    },
    Rule {
        name: "html",
        matches: |p| p.ct("text/html"),
        kind: ContentKind::Html,
    },
    Rule {
        name: "css",
        matches: |p| p.ct("text/css"),
        kind: ContentKind::Css,
    },
    Rule {
        name: "script",
        matches: |p| p.ct("javascript") || p.ct("ecmascript"),
        kind: ContentKind::Script,
    },
    Rule {
        name: "json",
        matches: |p| p.ct("json"),
        kind: ContentKind::Json,
    },
    Rule {
        name: "av-type",
        matches: |p| p.ct("video/") || p.ct("audio/"),
        kind: ContentKind::Stream,
    },
    Rule {
        name: "flv-dash-type",
        matches: |p| p.ct("flv") || p.ct("dash") || p.ct("mp2t"),
        kind: ContentKind::Stream,
    },
    Rule {
        name: "segment-url",
        matches: |p| p.ext(&[".ts", ".flv", ".m4s", ".mpd"]),
        kind: ContentKind::Stream,
    },
    Rule {
        name: "octet-media",
        matches: |p| p.ct("octet-stream") && p.ext(MEDIA_EXTENSIONS),
        kind: ContentKind::Stream,
    },
];

/// Classifies a response by content type and target URL.
pub fn classify(content_type: &str, url: &str) -> ContentKind {
    let probe = Probe::new(content_type, url);
    match RULES.iter().find(|rule| (rule.matches)(&probe)) {
        Some(rule) => {
            tracing::trace!(rule = rule.name, url, "Classified response");
            rule.kind
        }
        None => ContentKind::Buffered,
    }
}

/// Upstream response headers never forwarded to the client.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "set-cookie",
    "set-cookie2",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "x-content-type-options",
];

/// Copies upstream headers minus the ones that break proxying.
///
/// `rewritten` also drops `content-length` and `content-type`, since the
/// body is about to change.
pub fn sanitize_response_headers(upstream: &HeaderMap, rewritten: bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        let lower = name.as_str();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower) || lower.starts_with("access-control-") {
            continue;
        }
        if rewritten && (name == header::CONTENT_LENGTH || name == header::CONTENT_TYPE) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Re-encodes a 3xx `Location` through the proxy.
pub fn rewrite_location(headers: &mut HeaderMap, ctx: &RewriteContext) {
    let Some(location) = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return;
    };

    if let Some(rewritten) = ctx.rewrite_url(&location) {
        match HeaderValue::from_str(&rewritten) {
            Ok(value) => {
                headers.insert(header::LOCATION, value);
            }
            Err(e) => tracing::warn!(location, error = %e, "Failed to encode redirect"),
        }
    }
}

/// Records the upstream URL a response came from.
pub fn set_final_url(headers: &mut HeaderMap, target: &str) {
    if let Ok(value) = HeaderValue::from_str(target) {
        headers.insert(HeaderName::from_static("x-final-url"), value);
    }
}

pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD";
pub const CORS_DEFAULT_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, Authorization, Range";
pub const CORS_MAX_AGE: &str = "86400";

/// Adds permissive CORS headers, echoing any requested headers.
pub fn apply_cors(headers: &mut HeaderMap, requested_headers: Option<&HeaderValue>) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        requested_headers
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(CORS_DEFAULT_HEADERS)),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(CORS_MAX_AGE),
    );
}

type Completion = Box<dyn FnOnce(u64) + Send>;

/// Pass-through stream that counts bytes and reports the total once.
///
/// The callback fires when the inner stream ends, yields an error, or the
/// stream is dropped early (client disconnect), whichever happens first.
pub struct CountingStream<S> {
    inner: S,
    bytes: u64,
    on_complete: Option<Completion>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            inner,
            bytes: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Bytes relayed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn finish(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback(self.bytes);
        }
    }
}

impl<S, E> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> Drop for CountingStream<S> {
    fn drop(&mut self) {
        self.finish();
    }
}
