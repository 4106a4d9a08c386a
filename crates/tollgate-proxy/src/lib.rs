//! Tollgate Proxy - upstream fetching, rewriting and tunnelling.
//!
//! This crate holds everything that touches an origin server. It performs no
//! admission or accounting itself; the server crate decides whether a
//! request may proceed and records the bytes reported back from here.
//!
//! ## Architecture
//!
//! ```text
//! GET /https://site.example/page
//!        │
//!        ▼
//!   UpstreamClient::fetch ──► classify(content-type, url)
//!                                  │
//!        ┌─────────────┬───────────┼──────────────┬────────────┐
//!        ▼             ▼           ▼              ▼            ▼
//!      Html           Css     HlsManifest    Script/Json    Stream
//!  rewrite_html  rewrite_css  rewrite_hls     as text    CountingStream
//!  + shim
//! ```
//!
//! `CONNECT host:port` bypasses all of the above: [`tunnel::connect`] opens
//! the upstream socket and [`tunnel::relay`] copies bytes both ways.

pub mod delivery;
pub mod detect;
mod error;
pub mod rewrite;
pub mod shim;
pub mod tunnel;
pub mod upstream;

pub use delivery::{classify, ContentKind, CountingStream};
pub use detect::{Detection, Detector, MediaType};
pub use error::{ProxyError, Result};
pub use rewrite::{rewrite_css, rewrite_hls, rewrite_html, RewriteContext};
pub use upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};
