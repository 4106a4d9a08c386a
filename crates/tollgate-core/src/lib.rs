//! Tollgate Core - URL routing, IP limits, and quota decisions.
//!
//! This crate holds the pure logic of the Tollgate rewriting proxy. Nothing
//! in here performs I/O; persistence lives in `tollgate-storage` and the
//! network side lives in `tollgate-proxy`.
//!
//! ## Modules
//!
//! - [`url_codec`] - proxy path <-> upstream URL conversion
//! - [`net`] - IP / CIDR patterns shared by the filters below
//! - [`access`] - allow-list and blacklist checks
//! - [`ip_limits`] - per-IP / per-CIDR rate and bandwidth overrides
//! - [`quota`] - tier resolution and admit/deny decisions
//! - [`card`] - card-code generation and privacy masking
//! - [`size`] - size parsing and human formatting

pub mod access;
pub mod card;
pub mod error;
pub mod ip_limits;
pub mod net;
pub mod quota;
pub mod size;
pub mod url_codec;

pub use access::{AccessDenied, AccessFilter};
pub use card::{generate_code, mask_ip, normalize_code, CardError};
pub use error::{CoreError, Result};
pub use ip_limits::{IpLimitConfig, IpLimitRegistry};
pub use net::IpPattern;
pub use quota::{
    evaluate, plan_deduction, Admission, DeductionPlan, EffectiveLimits, GlobalLimits,
    PackageAllowance, QuotaDenial, QuotaPolicy, Tier, UsageSnapshot, UNLIMITED,
};
pub use size::{format_bandwidth, parse_limit, parse_size, time_until};
pub use url_codec::{Decoded, UrlCodecError};
