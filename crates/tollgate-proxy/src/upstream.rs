//! Upstream fetcher.
//!
//! Forwards a client request to the origin with hop-by-hop and edge headers
//! removed. Redirects are never followed here; a 3xx comes back to the
//! caller so its `Location` can be re-encoded through the proxy.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};

use crate::error::{describe, ProxyError, Result};

/// User-Agent sent when the client supplied none.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Time allowed for response headers, and between body reads.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request headers that never reach the origin.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "accept-encoding",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "transfer-encoding",
];

/// Edge networks stamp their own identifiers with these prefixes.
const EDGE_HEADER_PREFIXES: &[&str] = &["cf-", "cdn-loop"];

/// A request to send upstream.
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    body: Option<reqwest::Body>,
}

impl UpstreamRequest {
    /// A body-less request.
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body: None,
        }
    }

    /// Sends a fully buffered body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(reqwest::Body::from(body.into()));
        self
    }
}

/// Upstream status and headers, with the body still unread.
pub struct UpstreamResponse {
    url: String,
    status: StatusCode,
    headers: HeaderMap,
    inner: reqwest::Response,
}

impl UpstreamResponse {
    /// The URL that was fetched.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The `Content-Type` header, or an empty string.
    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// The declared body length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    /// Body as a stream of chunks. Read errors surface as `Upstream`.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        self.inner
            .bytes_stream()
            .map_err(ProxyError::from)
            .boxed()
    }

    /// Buffers the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        Ok(self.inner.bytes().await?)
    }

    /// Buffers the whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// HTTP client used for all proxied traffic.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    header_timeout: Duration,
}

impl UpstreamClient {
    /// Creates a client with the default 30 second timeouts.
    pub fn new() -> Result<Self> {
        Self::with_timeouts(UPSTREAM_TIMEOUT, UPSTREAM_TIMEOUT)
    }

    /// Creates a client with explicit header and body timeouts.
    pub fn with_timeouts(header_timeout: Duration, body_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT.min(header_timeout))
            .read_timeout(body_timeout)
            .build()
            .map_err(|e| ProxyError::Http(describe(&e)))?;

        Ok(Self {
            client,
            header_timeout,
        })
    }

    /// Sends `request` and waits for the response headers.
    pub async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let UpstreamRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self
            .client
            .request(method.clone(), url.as_str())
            .headers(forward_headers(&headers));
        if let Some(body) = body {
            builder = builder.body(body);
        }

        tracing::debug!(method = %method, url = %url, "Fetching upstream");

        let response = match tokio::time::timeout(self.header_timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(url = %url, error = %e, "Upstream request failed");
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!(url = %url, "Upstream response headers timed out");
                return Err(ProxyError::Upstream(format!(
                    "no response headers within {}s",
                    self.header_timeout.as_secs()
                )));
            }
        };

        Ok(UpstreamResponse {
            url,
            status: response.status(),
            headers: response.headers().clone(),
            inner: response,
        })
    }
}

/// Filters inbound client headers down to what the origin should see.
///
/// A `Referer` that points at a proxied page is unwrapped to the upstream
/// page it embeds.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 1);

    for (name, value) in inbound {
        if is_dropped(name) {
            continue;
        }
        if name == header::REFERER {
            if let Some(unwrapped) = unwrap_referer(value) {
                out.append(name.clone(), unwrapped);
                continue;
            }
        }
        out.append(name.clone(), value.clone());
    }

    if !out.contains_key(header::USER_AGENT) {
        out.insert(
            header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
    }

    out
}

fn is_dropped(name: &HeaderName) -> bool {
    let name = name.as_str();
    DROPPED_REQUEST_HEADERS.contains(&name)
        || EDGE_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn unwrap_referer(value: &HeaderValue) -> Option<HeaderValue> {
    let referer = url::Url::parse(value.to_str().ok()?).ok()?;
    let embedded = referer.path().strip_prefix('/')?;
    if !tollgate_core::url_codec::has_http_scheme(embedded) {
        return None;
    }
    let mut target = embedded.to_string();
    if let Some(query) = referer.query() {
        target.push('?');
        target.push_str(query);
    }
    HeaderValue::from_str(&target).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;

    async fn spawn_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_forward_headers_filters() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("proxy.example"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("accept-encoding", HeaderValue::from_static("gzip"));
        inbound.insert("cf-connecting-ip", HeaderValue::from_static("1.2.3.4"));
        inbound.insert("cf-ray", HeaderValue::from_static("abc"));
        inbound.insert("accept", HeaderValue::from_static("text/html"));

        let out = forward_headers(&inbound);
        assert!(out.get("host").is_none());
        assert!(out.get("connection").is_none());
        assert!(out.get("accept-encoding").is_none());
        assert!(out.get("cf-connecting-ip").is_none());
        assert!(out.get("cf-ray").is_none());
        assert_eq!(out.get("accept").unwrap(), "text/html");
        assert_eq!(out.get("user-agent").unwrap(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_forward_headers_keeps_client_user_agent() {
        let mut inbound = HeaderMap::new();
        inbound.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let out = forward_headers(&inbound);
        assert_eq!(out.get("user-agent").unwrap(), "curl/8.0");
    }

    #[test]
    fn test_referer_unwrapped() {
        let mut inbound = HeaderMap::new();
        inbound.insert(
            "referer",
            HeaderValue::from_static("https://proxy.example/https://site.example/page?x=1"),
        );
        let out = forward_headers(&inbound);
        assert_eq!(
            out.get("referer").unwrap(),
            "https://site.example/page?x=1"
        );

        let mut plain = HeaderMap::new();
        plain.insert("referer", HeaderValue::from_static("https://other.example/"));
        let out = forward_headers(&plain);
        assert_eq!(out.get("referer").unwrap(), "https://other.example/");
    }

    #[tokio::test]
    async fn test_redirect_not_followed() {
        let app = Router::new()
            .route(
                "/start",
                get(|| async {
                    (
                        StatusCode::FOUND,
                        [(header::LOCATION, "/finish")],
                        "moved",
                    )
                }),
            )
            .route("/finish", get(|| async { "done" }));
        let base = spawn_upstream(app).await;

        let client = UpstreamClient::new().unwrap();
        let response = client
            .fetch(UpstreamRequest::new(
                Method::GET,
                format!("{base}/start"),
                HeaderMap::new(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/finish");
    }

    #[tokio::test]
    async fn test_body_forwarded() {
        let app = Router::new().route("/echo", post(|body: String| async move { body }));
        let base = spawn_upstream(app).await;

        let client = UpstreamClient::new().unwrap();
        let request = UpstreamRequest::new(Method::POST, format!("{base}/echo"), HeaderMap::new())
            .with_body("hello upstream");
        let response = client.fetch(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hello upstream");
    }

    #[tokio::test]
    async fn test_connection_failure_is_upstream_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = UpstreamClient::new().unwrap();
        let err = client
            .fetch(UpstreamRequest::new(
                Method::GET,
                format!("http://{addr}/"),
                HeaderMap::new(),
            ))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ProxyError::Upstream(_)));
        assert!(err.to_string().starts_with("Upstream Error: "));
    }

    #[tokio::test]
    async fn test_header_timeout() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let base = spawn_upstream(app).await;

        let client =
            UpstreamClient::with_timeouts(Duration::from_millis(200), UPSTREAM_TIMEOUT).unwrap();
        let err = client
            .fetch(UpstreamRequest::new(
                Method::GET,
                format!("{base}/slow"),
                HeaderMap::new(),
            ))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
