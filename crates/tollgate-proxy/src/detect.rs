//! Stream detection.
//!
//! Follows a redirect chain by hand and inspects the final response to
//! report the real media URL and its format, without proxying the body.

use std::time::Duration;

use hyper::header::{self, HeaderMap};
use hyper::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::error::{describe, ProxyError, Result};
use crate::upstream::{DEFAULT_USER_AGENT, UPSTREAM_TIMEOUT};

/// Hops followed before giving up and reporting the last one.
pub const MAX_REDIRECTS: usize = 10;

const SNIFF_BYTES: usize = 1024;

static FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*?\s*=\s*(?:UTF-8'')?(?:"([^"]*)"|'([^']*)'|([^;\s]+))"#)
        .expect("Invalid Content-Disposition regex")
});

/// Media format reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Hls,
    Flv,
    Dash,
    Mp4,
    Audio,
    Unknown,
}

impl MediaType {
    /// Derives the media type from a content type.
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("m3u8") || ct.contains("mpegurl") {
            Self::Hls
        } else if ct.contains("flv") {
            Self::Flv
        } else if ct.contains("dash") {
            Self::Dash
        } else if ct.contains("mp4") {
            Self::Mp4
        } else if ct.contains("audio/") {
            Self::Audio
        } else {
            Self::Unknown
        }
    }

    /// Derives the media type from URL text.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains(".m3u8") || lower.contains("m3u") {
            Self::Hls
        } else if lower.contains(".flv") {
            Self::Flv
        } else if lower.contains(".mpd") {
            Self::Dash
        } else if lower.contains(".mp4") {
            Self::Mp4
        } else if lower.contains(".mp3") || lower.contains(".aac") {
            Self::Audio
        } else {
            Self::Unknown
        }
    }
}

/// Successful detection report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub success: bool,
    pub original_url: String,
    pub final_url: String,
    pub redirected: bool,
    pub media_type: MediaType,
    pub content_type: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_filename: Option<String>,
}

/// Follows redirects and sniffs the final response.
#[derive(Clone)]
pub struct Detector {
    client: reqwest::Client,
    max_redirects: usize,
}

impl Detector {
    pub fn new() -> Result<Self> {
        Self::with_timeout(UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Http(describe(&e)))?;
        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }

    /// Detects the final URL and media type behind `target`.
    pub async fn detect(&self, target: &str) -> Result<Detection> {
        if !tollgate_core::url_codec::has_http_scheme(target) {
            return Err(ProxyError::InvalidTarget(target.to_string()));
        }
        let mut current =
            Url::parse(target).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        let mut requested = target.to_string();

        let mut hops = 0;
        let mut status;
        let mut content_type = String::new();
        let mut download_filename = None;

        loop {
            tracing::debug!(url = %current, hops, "Detection fetch");
            let mut response = self
                .client
                .get(requested.as_str())
                .send()
                .await
                .map_err(|e| ProxyError::Detection(describe(&e)))?;
            status = response.status();

            if is_redirect(status) {
                if hops >= self.max_redirects {
                    tracing::warn!(url = %current, "Max redirects reached");
                    break;
                }
                let Some(next) = location(response.headers(), &current) else {
                    tracing::warn!(url = %current, "Redirect without usable Location");
                    break;
                };
                tracing::debug!(from = %current, to = %next, %status, "Following redirect");
                requested = next.to_string();
                current = next;
                hops += 1;
                continue;
            }

            if status.is_success() {
                content_type = header_str(response.headers(), header::CONTENT_TYPE).to_string();

                if let Some(filename) = disposition_filename(response.headers()) {
                    if let Some(ct) = content_type_for_filename(&filename) {
                        content_type = ct.to_string();
                    }
                    download_filename = Some(filename);
                }

                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if let Some(ct) = sniff(&chunk[..chunk.len().min(SNIFF_BYTES)]) {
                            content_type = ct.to_string();
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to read detection body"),
                }
            } else {
                tracing::warn!(url = %current, %status, "Detection stopped on error status");
            }
            break;
        }

        let redirected = requested != target;
        let final_url = requested;
        let media_type = match MediaType::from_content_type(&content_type) {
            MediaType::Unknown => MediaType::from_url(&final_url),
            known => known,
        };

        tracing::info!(
            url = target,
            final_url = %final_url,
            media_type = ?media_type,
            status = status.as_u16(),
            "Detection completed"
        );

        Ok(Detection {
            success: true,
            original_url: target.to_string(),
            redirected,
            final_url,
            media_type,
            content_type,
            status_code: status.as_u16(),
            download_filename,
        })
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn location(headers: &HeaderMap, base: &Url) -> Option<Url> {
    let raw = header_str(headers, header::LOCATION);
    if raw.is_empty() {
        return None;
    }
    base.join(raw).ok()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let disposition = header_str(headers, header::CONTENT_DISPOSITION);
    let caps = FILENAME_RE.captures(disposition)?;
    let name = caps.get(1).or(caps.get(2)).or(caps.get(3))?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Content type implied by a download filename's extension.
pub fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    [
        (".m3u8", "application/vnd.apple.mpegurl"),
        (".flv", "video/x-flv"),
        (".mpd", "application/dash+xml"),
        (".mp4", "video/mp4"),
        (".mp3", "audio/mpeg"),
        (".aac", "audio/aac"),
    ]
    .into_iter()
    .find(|(ext, _)| lower.ends_with(ext))
    .map(|(_, ct)| ct)
}

/// Content type implied by the first bytes of a body.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"FLV") {
        return Some("video/x-flv");
    }
    let text = String::from_utf8_lossy(head);
    if text.trim_start().starts_with("#EXTM3U") || text.contains("#EXTINF") {
        return Some("application/vnd.apple.mpegurl");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
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
    fn test_media_type_precedence() {
        assert_eq!(MediaType::from_content_type("application/x-mpegURL"), MediaType::Hls);
        assert_eq!(MediaType::from_content_type("video/x-flv"), MediaType::Flv);
        assert_eq!(MediaType::from_content_type("application/dash+xml"), MediaType::Dash);
        assert_eq!(MediaType::from_content_type("video/mp4"), MediaType::Mp4);
        assert_eq!(MediaType::from_content_type("audio/aac"), MediaType::Audio);
        assert_eq!(MediaType::from_content_type("text/html"), MediaType::Unknown);
        assert_eq!(MediaType::from_url("https://a.example/x.flv?t=1"), MediaType::Flv);
        assert_eq!(MediaType::from_url("https://a.example/x.mp3"), MediaType::Audio);
        assert_eq!(MediaType::from_url("https://a.example/x"), MediaType::Unknown);
    }

    #[test]
    fn test_filename_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"clip.m3u8\"".parse().unwrap(),
        );
        assert_eq!(disposition_filename(&headers).as_deref(), Some("clip.m3u8"));

        headers.insert(
            header::CONTENT_DISPOSITION,
            "attachment; filename=live.FLV; size=10".parse().unwrap(),
        );
        assert_eq!(disposition_filename(&headers).as_deref(), Some("live.FLV"));
        assert_eq!(content_type_for_filename("live.FLV"), Some("video/x-flv"));
        assert_eq!(content_type_for_filename("notes.txt"), None);
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(b"FLV\x01\x05"), Some("video/x-flv"));
        assert_eq!(sniff(b"\n#EXTM3U\n"), Some("application/vnd.apple.mpegurl"));
        assert_eq!(sniff(b"junk\n#EXTINF:4,\n"), Some("application/vnd.apple.mpegurl"));
        assert_eq!(sniff(b"<html>"), None);
    }

    #[tokio::test]
    async fn test_redirect_chain_with_disposition() {
        let app = Router::new()
            .route(
                "/video",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/hop")], "") }),
            )
            .route(
                "/hop",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/final?sig=1")], "") }),
            )
            .route(
                "/final",
                get(|| async {
                    (
                        [
                            (header::CONTENT_TYPE, "application/octet-stream"),
                            (header::CONTENT_DISPOSITION, "attachment; filename=\"clip.m3u8\""),
                        ],
                        "binary",
                    )
                }),
            );
        let base = spawn_upstream(app).await;
        let target = format!("{base}/video");

        let detection = Detector::new().unwrap().detect(&target).await.unwrap();

        assert!(detection.success);
        assert!(detection.redirected);
        assert_eq!(detection.original_url, target);
        assert_eq!(detection.final_url, format!("{base}/final?sig=1"));
        assert_eq!(detection.media_type, MediaType::Hls);
        assert_eq!(detection.status_code, 200);
        assert_eq!(detection.download_filename.as_deref(), Some("clip.m3u8"));

        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["mediaType"], "hls");
        assert_eq!(json["finalUrl"], format!("{base}/final?sig=1"));
        assert_eq!(json["downloadFilename"], "clip.m3u8");
    }

    #[tokio::test]
    async fn test_body_sniff_overrides_content_type() {
        let app = Router::new().route(
            "/live",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "#EXTM3U\n#EXTINF:4,\na.ts\n") }),
        );
        let base = spawn_upstream(app).await;

        let detection = Detector::new()
            .unwrap()
            .detect(&format!("{base}/live"))
            .await
            .unwrap();

        assert!(!detection.redirected);
        assert_eq!(detection.media_type, MediaType::Hls);
        assert_eq!(detection.content_type, "application/vnd.apple.mpegurl");
        assert!(detection.download_filename.is_none());
        let json = serde_json::to_value(&detection).unwrap();
        assert!(json.get("downloadFilename").is_none());
    }

    #[tokio::test]
    async fn test_final_url_keeps_literal_target() {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "video/mp4")], vec![0u8; 16]) }),
        );
        let base = spawn_upstream(app).await;

        let detection = Detector::new().unwrap().detect(&base).await.unwrap();
        assert!(!detection.redirected);
        assert_eq!(detection.original_url, base);
        assert_eq!(detection.final_url, base);
        assert_eq!(detection.media_type, MediaType::Mp4);
    }

    #[tokio::test]
    async fn test_redirect_loop_stops() {
        let app = Router::new().route(
            "/loop",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/loop")], "") }),
        );
        let base = spawn_upstream(app).await;

        let detection = Detector::new()
            .unwrap()
            .detect(&format!("{base}/loop"))
            .await
            .unwrap();
        assert_eq!(detection.status_code, 302);
        assert!(!detection.redirected);
    }

    #[tokio::test]
    async fn test_invalid_and_unreachable() {
        let detector = Detector::new().unwrap();
        assert!(matches!(
            detector.detect("ftp://x.example/a").await,
            Err(ProxyError::InvalidTarget(_))
        ));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            detector.detect(&format!("http://{addr}/x")).await,
            Err(ProxyError::Detection(_))
        ));
    }
}
