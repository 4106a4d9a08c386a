//! API error types.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use tollgate_core::quota::RETRY_AFTER_SECS;
use tollgate_core::{AccessDenied, CardError, QuotaDenial};
use tollgate_proxy::ProxyError;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Client address is blacklisted or outside the allow list.
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    /// Rate or byte quota exhausted.
    #[error(transparent)]
    Quota(#[from] QuotaDenial),

    /// Card lookup or redemption failed.
    #[error(transparent)]
    Card(#[from] CardError),

    /// The `code` query parameter is missing.
    #[error("Please provide a card code in the query parameter")]
    CodeRequired,

    /// Admin secret mismatch.
    #[error("Invalid admin secret")]
    Unauthorized,

    /// Proxy target is missing or malformed.
    #[error("{0}")]
    InvalidTarget(String),

    /// Detection target is not an http(s) URL.
    #[error("Please provide a valid HTTP/HTTPS URL")]
    InvalidUrl,

    /// Nothing to proxy at this path.
    #[error("{0}")]
    NotFound(String),

    /// Bad request.
    #[error("{0}")]
    BadRequest(String),

    /// Upstream fetch failed.
    #[error("{0}")]
    Upstream(String),

    /// Stream detection failed.
    #[error("{message}")]
    Detection {
        message: String,
        original_url: String,
    },

    /// Internal server error.
    #[error("{0}")]
    Internal(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] tollgate_storage::StorageError),
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::InvalidTarget(m) => ApiError::InvalidTarget(m),
            other => ApiError::Upstream(other.detail()),
        }
    }
}

/// Error response body.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_recharge: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Card(_)
            | ApiError::CodeRequired
            | ApiError::InvalidTarget(_)
            | ApiError::InvalidUrl
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) | ApiError::Detection { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AccessDenied(_) => "Access Denied",
            ApiError::Quota(denial) => denial.code(),
            ApiError::Card(err) => err.code(),
            ApiError::CodeRequired => "Card code required",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::InvalidTarget(_) => "Invalid Target URL",
            ApiError::InvalidUrl => "Invalid URL",
            ApiError::NotFound(_) => "Not Found",
            ApiError::BadRequest(_) => "Bad Request",
            ApiError::Upstream(_) => "Upstream Error",
            ApiError::Detection { .. } => "Detection Failed",
            ApiError::Internal(_) | ApiError::Storage(_) => "Internal Server Error",
        }
    }

    fn body(&self) -> ErrorResponse {
        let mut body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            ..ErrorResponse::default()
        };

        match self {
            ApiError::Quota(QuotaDenial::RateLimitExceeded { limit, current }) => {
                body.can_recharge = Some(true);
                body.retry_after = Some(RETRY_AFTER_SECS);
                body.limit = Some(*limit);
                body.current = Some(*current);
            }
            ApiError::Quota(QuotaDenial::QuotaExceeded { limit, used, .. }) => {
                body.can_recharge = Some(true);
                body.limit = Some(*limit);
                body.current = Some(*used);
            }
            ApiError::Card(_) => body.success = Some(false),
            ApiError::Detection { original_url, .. } => {
                body.success = Some(false);
                body.original_url = Some(original_url.clone());
            }
            _ => {}
        }

        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }

        let mut response = (status, axum::Json(self.body())).into_response();
        if matches!(self, ApiError::Quota(QuotaDenial::RateLimitExceeded { .. })) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
