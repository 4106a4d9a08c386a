//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Target URL is missing or malformed.
    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    /// Upstream fetch failed or timed out.
    #[error("Upstream Error: {0}")]
    Upstream(String),

    /// Stream detection could not complete.
    #[error("Detection Failed: {0}")]
    Detection(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl ProxyError {
    /// Message without the kind prefix, for JSON error bodies.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidTarget(m) | Self::Upstream(m) | Self::Detection(m) | Self::Http(m) => {
                m.clone()
            }
            Self::Io(e) => e.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(describe(&err))
    }
}

/// Flattens an error and its sources into one line.
pub(crate) fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
