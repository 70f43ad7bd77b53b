use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// An access token, along with the refresh token that can renew it
///
/// An empty refresh token is treated the same as no refresh token at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialPair {
    access_token: AccessToken,
    refresh_token: Option<RefreshToken>,
}

impl CredentialPair {
    /// Constructs a new credential pair
    pub fn new(access_token: AccessToken, refresh_token: Option<RefreshToken>) -> Self {
        Self {
            access_token,
            refresh_token: refresh_token.filter(|t| !t.as_str().is_empty()),
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token, if one is available
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Splits the pair into its owned tokens
    #[inline]
    pub fn into_parts(self) -> (AccessToken, Option<RefreshToken>) {
        (self.access_token, self.refresh_token)
    }
}
