//! A REST client that keeps its bearer token alive
//!
//! [`RefreshingClient`] sends JSON requests to an API, attaching the current
//! access token to each. It watches the token's expiry and exchanges the
//! refresh token for new credentials when the access token has expired or is
//! about to. When the API rejects a token anyway, the client refreshes and
//! retries the request once.
//!
//! ```no_run
//! use graft_reqwest::{ClientConfig, RefreshingClient};
//! use graft_tokens::{AccessToken, CredentialPair, RefreshToken};
//! use serde_json::Value;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), graft_reqwest::Error> {
//! let credentials = CredentialPair::new(
//!     AccessToken::from_static("eyJhbGciOi..."),
//!     Some(RefreshToken::from_static("0.AXcA...")),
//! );
//! let client = RefreshingClient::new(credentials, &ClientConfig::default())?;
//!
//! let me: Value = client.get("/me").await?;
//! println!("{}", me["displayName"]);
//! # Ok(()) }
//! ```
//!
//! For callers that manage tokens themselves, [`ApiClient`] sends requests
//! with whatever token it was last given and never refreshes.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
pub mod config;
mod error;
mod executor;
pub mod middleware;

pub use client::RefreshingClient;
pub use config::{credentials_from_env, ClientConfig, ConfigError};
pub use error::Error;
pub use executor::ApiClient;
