//! Bearer token inspection and refresh for REST API clients
//!
//! This crate holds the pieces of a token-aware client that do not depend on
//! how requests are sent:
//!
//! * [`claims`] reads the expiry out of a JWT access token (without verifying
//!   its signature) and decides whether it is fresh, expiring soon, or expired.
//! * [`refresh`] exchanges a refresh token for a new [`CredentialPair`] at a
//!   tenant-scoped OAuth2 token endpoint.
//! * Strongly typed [`AccessToken`], [`RefreshToken`], and [`TenantId`] values
//!   that will not print their secrets unless asked to with the alternate
//!   format (`{:#?}`).
//!
//! ```
//! use graft_tokens::{claims, AccessTokenRef, TokenStatus};
//!
//! let token = AccessTokenRef::from_str("eyJhbGciOiJub25lIn0.eyJleHAiOjB9.c2ln");
//! let snapshot = claims::inspect(token).unwrap();
//!
//! assert_eq!(snapshot.status(), TokenStatus::Expired);
//! assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
mod clock;
mod credentials;
pub mod refresh;

pub use braids::*;
pub use claims::{InspectError, TokenClaims, TokenStatus};
pub use clock::{Clock, DurationSecs, System, TestClock, UnixTime};
pub use credentials::CredentialPair;
pub use refresh::{OAuth2Refresher, RefreshError, RefreshSource};
