//! Card-code helpers.

use rand::RngCore;
use thiserror::Error;

/// Random bytes per code; rendered as twice as many hex digits.
pub const CODE_BYTES: usize = 16;

/// Redemption and lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CardError {
    #[error("Invalid card code")]
    NotFound,

    #[error("Card already used")]
    AlreadyUsed,

    #[error("Card expired")]
    Expired,
}

impl CardError {
    pub fn code(&self) -> &'static str {
        match self {
            CardError::NotFound => "CardInvalid",
            CardError::AlreadyUsed => "CardUsed",
            CardError::Expired => "CardExpired",
        }
    }
}

/// Generates a fresh opaque code: 32 upper-case hex digits.
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Canonical form used for lookups.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Hides the host part of an address for display.
///
/// `192.168.1.100` becomes `192.168.*.**` and `2001:db8::1` becomes
/// `2001:db8::*`. Anything else is returned unchanged.
pub fn mask_ip(ip: &str) -> String {
    if ip.contains(':') {
        let parts: Vec<&str> = ip.split(':').collect();
        if parts.len() > 2 {
            return format!("{}:{}::*", parts[0], parts[1]);
        }
        return ip.to_string();
    }

    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() == 4 {
        format!("{}.{}.*.**", parts[0], parts[1])
    } else {
        ip.to_string()
    }
}
