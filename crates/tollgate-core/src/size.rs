//! Byte-size parsing and human-readable formatting.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CoreError, Result};
use crate::quota::UNLIMITED;

const KB: i64 = 1024;
const MB: i64 = KB * 1024;
const GB: i64 = MB * 1024;
const TB: i64 = GB * 1024;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*(KB|MB|GB|TB)?$").expect("Invalid size regex")
});

/// Parses `10GB`, `500 mb`, `1.5TB` or a bare byte count.
///
/// Units are binary multiples; a missing unit means bytes.
pub fn parse_size(s: &str) -> Result<i64> {
    let caps = SIZE_RE
        .captures(s.trim())
        .ok_or_else(|| CoreError::InvalidSize(s.to_string()))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| CoreError::InvalidSize(s.to_string()))?;

    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => 1,
        Some(unit) => match unit.as_str() {
            "KB" => KB,
            "MB" => MB,
            "GB" => GB,
            _ => TB,
        },
    };

    let bytes = (value * multiplier as f64).floor();
    if !bytes.is_finite() || bytes >= i64::MAX as f64 {
        return Err(CoreError::InvalidSize(s.to_string()));
    }
    Ok(bytes as i64)
}

/// Parses a byte limit that may also be `*` or `-1` for unlimited.
pub fn parse_limit(s: &str) -> Result<i64> {
    match s.trim() {
        "*" | "-1" => Ok(UNLIMITED),
        other => parse_size(other),
    }
}

/// Formats a byte count as `1.50GB`, `12B`, or `Unlimited`.
pub fn format_bandwidth(bytes: i64) -> String {
    if bytes == UNLIMITED {
        return "Unlimited".to_string();
    }

    let n = bytes as f64;
    if bytes >= TB {
        format!("{:.2}TB", n / TB as f64)
    } else if bytes >= GB {
        format!("{:.2}GB", n / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", n / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", n / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

/// Coarse countdown such as `3 days`, `1 hour`, or `expired`.
pub fn time_until(target: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = target - now;
    if diff.num_milliseconds() <= 0 {
        return "expired".to_string();
    }

    let plural = |n: i64, unit: &str| format!("{n} {unit}{}", if n > 1 { "s" } else { "" });

    let days = diff.num_days();
    let hours = diff.num_hours() % 24;
    if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else {
        plural(diff.num_minutes() % 60, "minute")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1073741824").unwrap(), GB);
        assert_eq!(parse_size("10GB").unwrap(), 10 * GB);
        assert_eq!(parse_size("500mb").unwrap(), 500 * MB);
        assert_eq!(parse_size("1.5 KB").unwrap(), 1536);
        assert_eq!(parse_size(" 2TB ").unwrap(), 2 * TB);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("ten GB").is_err());
        assert!(parse_size("10PB").is_err());
        assert!(parse_size("-5").is_err());
    }

    #[test]
    fn test_parse_limit_unlimited() {
        assert_eq!(parse_limit("*").unwrap(), UNLIMITED);
        assert_eq!(parse_limit("-1").unwrap(), UNLIMITED);
        assert_eq!(parse_limit("100MB").unwrap(), 100 * MB);
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(UNLIMITED), "Unlimited");
        assert_eq!(format_bandwidth(512), "512B");
        assert_eq!(format_bandwidth(1536), "1.50KB");
        assert_eq!(format_bandwidth(10 * GB), "10.00GB");
        assert_eq!(format_bandwidth(3 * TB), "3.00TB");
    }

    #[test]
    fn test_time_until() {
        let now = Utc::now();
        assert_eq!(time_until(now - Duration::seconds(1), now), "expired");
        assert_eq!(time_until(now + Duration::days(30), now), "30 days");
        assert_eq!(time_until(now + Duration::hours(25), now), "1 day");
        assert_eq!(time_until(now + Duration::hours(5), now), "5 hours");
        assert_eq!(time_until(now + Duration::minutes(1), now), "1 minute");
        assert_eq!(time_until(now + Duration::minutes(42), now), "42 minutes");
    }
}
