//! Expiry inspection for bearer tokens
//!
//! A bearer token issued as a JWT carries its own expiry in the `exp` claim.
//! The functions here read that claim **without** verifying the token's
//! signature. The token is only ever echoed back to its issuer, so the claims
//! are used to decide _when_ to refresh, never to authorize anything locally.
//!
//! ```
//! use graft_tokens::{claims, AccessTokenRef, TestClock, UnixTime};
//!
//! // {"alg":"none"} . {"exp":1700000300} . signature
//! let token = AccessTokenRef::from_str("eyJhbGciOiJub25lIn0.eyJleHAiOjE3MDAwMDAzMDB9.c2ln");
//! let clock = TestClock::new(UnixTime(1_700_000_000));
//!
//! let snapshot = claims::inspect_with_clock(token, &clock).unwrap();
//! assert!(!snapshot.is_expired());
//! assert!(snapshot.expires_soon());
//! assert_eq!(snapshot.time_until_expiry(), 300);
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::{Clock, DurationSecs, System, UnixTime};
use crate::AccessTokenRef;

/// Tokens with less than this much validity remaining are considered to be
/// expiring soon and eligible for a proactive refresh
pub const EXPIRING_SOON_WINDOW: DurationSecs = DurationSecs(600);

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not close to expiring
    Fresh,
    /// The token is still valid, but should be refreshed
    ExpiringSoon,
    /// The token is no longer valid
    Expired,
}

/// A snapshot of a token's expiry state, as of the moment it was inspected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    expires_at: UnixTime,
    time_until_expiry: i64,
    is_expired: bool,
    expires_soon: bool,
}

impl TokenClaims {
    fn at(expires_at: UnixTime, now: UnixTime) -> Self {
        let time_until_expiry = now.seconds_until(expires_at);
        let is_expired = now > expires_at;
        let expires_soon = !is_expired && expires_at < now + EXPIRING_SOON_WINDOW;

        Self {
            expires_at,
            time_until_expiry,
            is_expired,
            expires_soon,
        }
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Seconds remaining until the token expires
    ///
    /// Negative if the token had already expired when inspected.
    #[inline]
    pub fn time_until_expiry(&self) -> i64 {
        self.time_until_expiry
    }

    /// Gets a duration for how much longer the token will be valid, or zero
    /// if it has expired
    #[inline]
    pub fn until_expired(&self) -> DurationSecs {
        DurationSecs(u64::try_from(self.time_until_expiry).unwrap_or(0))
    }

    /// Whether the token had expired when inspected
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired
    }

    /// Whether the token was still valid, but within [`EXPIRING_SOON_WINDOW`]
    /// of its expiry when inspected
    #[inline]
    pub fn expires_soon(&self) -> bool {
        self.expires_soon
    }

    /// Gets the token's lifecycle status
    #[inline]
    pub fn status(&self) -> TokenStatus {
        if self.is_expired {
            TokenStatus::Expired
        } else if self.expires_soon {
            TokenStatus::ExpiringSoon
        } else {
            TokenStatus::Fresh
        }
    }
}

/// The token could not be decoded into header, claims, and signature sections
#[derive(Debug, Error)]
pub enum MalformedToken {
    /// The token did not have exactly three `.`-separated segments
    #[error("expected 3 segments, found {0}")]
    SegmentCount(usize),

    /// A segment was not valid base64url
    #[error("{section} is not valid base64url")]
    Encoding {
        /// The section that failed to decode
        section: &'static str,
        /// The underlying decoding error
        source: base64::DecodeError,
    },

    /// A segment was not a JSON object
    #[error("{section} is not a JSON object")]
    Json {
        /// The section that failed to parse
        section: &'static str,
        /// The underlying parsing error
        source: serde_json::Error,
    },
}

/// An error while inspecting a token's claims
#[derive(Debug, Error)]
pub enum InspectError {
    /// The token is not a well-formed JWT
    #[error("malformed bearer token")]
    Malformed(#[from] MalformedToken),

    /// The claims do not include `exp`
    #[error("token does not contain an expiration claim")]
    MissingExpiry,

    /// The `exp` claim is present, but is not a number
    #[error("token expiration claim is not numeric")]
    InvalidExpiryType,
}

/// Inspects a token's expiry using the system clock
#[inline]
pub fn inspect(token: &AccessTokenRef) -> Result<TokenClaims, InspectError> {
    inspect_with_clock(token, &System)
}

/// Inspects a token's expiry based on the current time as reported by the
/// provided clock
#[inline]
pub fn inspect_with_clock<C: Clock>(
    token: &AccessTokenRef,
    clock: &C,
) -> Result<TokenClaims, InspectError> {
    inspect_at(token, clock.now())
}

/// Inspects a token's expiry as of the provided time
pub fn inspect_at(token: &AccessTokenRef, now: UnixTime) -> Result<TokenClaims, InspectError> {
    let claims = decode_claims(token.as_str())?;
    let expires_at = expiration(&claims)?;
    Ok(TokenClaims::at(expires_at, now))
}

fn decode_claims(token: &str) -> Result<Map<String, Value>, MalformedToken> {
    let segments: Vec<&str> = token.split('.').collect();
    let (header, payload) = match segments.as_slice() {
        [header, payload, _signature] => (*header, *payload),
        other => return Err(MalformedToken::SegmentCount(other.len())),
    };

    // The header is not used, but a token whose header does not decode is not a JWT.
    decode_section::<Map<String, Value>>("header", header)?;
    decode_section("payload", payload)
}

fn decode_section<T>(section: &'static str, encoded: &str) -> Result<T, MalformedToken>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|source| MalformedToken::Encoding { section, source })?;
    serde_json::from_slice(&raw).map_err(|source| MalformedToken::Json { section, source })
}

fn expiration(claims: &Map<String, Value>) -> Result<UnixTime, InspectError> {
    let exp = match claims.get("exp") {
        Some(Value::Number(n)) => n,
        Some(_) => return Err(InspectError::InvalidExpiryType),
        None => return Err(InspectError::MissingExpiry),
    };

    // Fractional seconds are truncated; anything before the epoch is the epoch.
    let secs = if let Some(secs) = exp.as_u64() {
        secs
    } else if exp.as_i64().is_some() {
        0
    } else {
        let f = exp.as_f64().ok_or(InspectError::InvalidExpiryType)?;
        if f <= 0.0 {
            0
        } else {
            f.trunc() as u64
        }
    };

    Ok(UnixTime(secs))
}
