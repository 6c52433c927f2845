//! # optik_core
//!
//! Authentication core for the Optik back-office: credential checks,
//! account lockout, JWT issuance and rotation, token revocation, session
//! tracking and tiered rate limiting.

pub mod auth;
pub mod clock;
pub mod config;
pub mod migrate;
pub mod models;
pub mod rate_limit;
pub mod store;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
