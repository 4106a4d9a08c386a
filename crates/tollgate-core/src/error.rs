//! Core error types.

use thiserror::Error;

/// Errors raised while parsing configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Size string did not match `<number>[KB|MB|GB|TB]`.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// Rate or bandwidth limit out of range.
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// IP address or CIDR range could not be parsed.
    #[error("invalid IP pattern: {0}")]
    InvalidIpPattern(String),

    /// IP limit definition was malformed.
    #[error("invalid IP limit entry: {0}")]
    InvalidIpLimit(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
