//! # zvnet-core - Shared building blocks
//!
//! `zvnet-core` holds the pieces of the zvnet transport that do not depend on a
//! running engine: the login record codec and its signing digest, NAT
//! classification, the bounded expiring cache used for pending work, and a few
//! address helpers.
//!
//! ## Modules
//!
//! - [`login`] - fixed-layout `LoginRecord` and the digest its signature covers
//! - [`nat`] - `NatType` and classification of probe observations
//! - [`cache`] - bounded map with per-entry expiry
//! - [`extend`] - address helpers
//!
//! ## Login records
//!
//! ```rust
//! use zvnet_core::login::{signing_digest, LoginRecord, PK_SIZE, SIGN_SIZE};
//!
//! let record = LoginRecord::new(42, 1_700_000_000, [0; PK_SIZE], [0; SIGN_SIZE]);
//! assert_eq!(record.digest(), signing_digest(42, 1_700_000_000));
//! assert!(record.is_fresh(1_700_000_100, 300));
//! ```
//!
//! ## See Also
//!
//! - [`zvnet`](../zvnet/index.html) - the session engine built on these types
//! - [`zvnet-reliable`](../zvnet_reliable/index.html) - the per-session ARQ

pub mod cache;
pub mod error;
pub mod extend;
pub mod login;
pub mod nat;

pub use error::{Error, Result};

/// Seconds since the unix epoch on the local wall clock.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
