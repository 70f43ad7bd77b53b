//! Exchanging a refresh token for new credentials
//!
//! [`OAuth2Refresher`] performs the OAuth2 `refresh_token` grant against a
//! tenant-scoped token endpoint of the form
//! `{authority}/{tenant}/oauth2/v2.0/token`. It does not hold on to any
//! credentials itself: the caller supplies the refresh token and applies the
//! returned [`CredentialPair`].

use std::error;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::{ClientId, CredentialPair, RefreshTokenRef, TenantId, TenantIdRef};

mod dto;

/// The default token issuing authority
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// The scope requested when refreshing, unless configured otherwise
pub const DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// An asynchronous source of refreshed credentials
#[async_trait]
pub trait RefreshSource: Send + Sync {
    /// The error type returned in the event that refreshing fails
    type Error: error::Error + Send + Sync + 'static;

    /// Exchanges `refresh_token` for a new credential pair
    ///
    /// If `tenant` is `None` or empty, the `common` tenant is used.
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
        tenant: Option<&TenantIdRef>,
    ) -> Result<CredentialPair, Self::Error>;
}

/// An error while attempting to refresh credentials with the authority
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The refresh request could not be formed; no request was sent
    #[error("invalid refresh request: {0}")]
    InvalidInput(&'static str),

    /// Unable to send the request or read the response
    #[error("error sending request to token authority")]
    Transport(#[source] reqwest::Error),

    /// The authority rejected the request with a structured error
    #[error("token authority returned {status}: {code}: {message}")]
    Remote {
        /// The HTTP status returned
        status: StatusCode,
        /// The authority's error code
        code: String,
        /// The authority's error description
        message: String,
    },

    /// The authority rejected the request with an unrecognized body
    #[error("token authority returned {status}: {body}")]
    Status {
        /// The HTTP status returned
        status: StatusCode,
        /// The raw response body
        body: String,
    },

    /// The authority accepted the request, but the token response was unusable
    #[error("malformed token response: {reason}")]
    MalformedResponse {
        /// What was wrong with the response
        reason: &'static str,
        /// The underlying decoding error, if any
        #[source]
        source: Option<serde_json::Error>,
    },
}

impl RefreshError {
    /// The HTTP status returned by the authority, if a response was received
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Remote { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }

    fn from_error_response(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<dto::ErrorBody>(body) {
            Ok(error) => {
                let (code, message) = error.into_code_and_message();
                Self::Remote {
                    status,
                    code,
                    message,
                }
            }
            Err(_) => Self::Status {
                status,
                body: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

/// Refreshes credentials using the OAuth2 refresh token grant
#[derive(Clone, Debug)]
pub struct OAuth2Refresher {
    client: reqwest::Client,
    authority: Url,
    scope: String,
    client_id: Option<ClientId>,
}

impl OAuth2Refresher {
    /// Constructs a new refresher against the given authority
    ///
    /// The authority is the base URL under which the tenant-scoped token
    /// endpoints live, such as [`DEFAULT_AUTHORITY`].
    pub fn new(client: reqwest::Client, authority: Url) -> Self {
        Self {
            client,
            authority,
            scope: DEFAULT_SCOPE.to_owned(),
            client_id: None,
        }
    }

    /// Requests a different scope when refreshing
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Identifies the client to the authority when refreshing
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// The token endpoint for a given tenant
    pub fn token_url(&self, tenant: Option<&TenantIdRef>) -> Result<Url, RefreshError> {
        let tenant = tenant
            .filter(|t| !t.as_str().is_empty())
            .unwrap_or_else(|| TenantIdRef::from_str(TenantId::COMMON));

        let mut url = self.authority.clone();
        url.path_segments_mut()
            .map_err(|()| RefreshError::InvalidInput("token authority cannot be a base URL"))?
            .pop_if_empty()
            .extend([tenant.as_str(), "oauth2", "v2.0", "token"]);
        Ok(url)
    }

    /// Exchanges a refresh token for a new credential pair
    ///
    /// If the authority rotates the refresh token, the new one is included in
    /// the returned pair; otherwise the pair holds no refresh token and the
    /// caller should keep using the one it has.
    pub async fn refresh_token(
        &self,
        refresh_token: &RefreshTokenRef,
        tenant: Option<&TenantIdRef>,
    ) -> Result<CredentialPair, RefreshError> {
        if refresh_token.as_str().is_empty() {
            return Err(RefreshError::InvalidInput("refresh token is required"));
        }

        let token_url = self.token_url(tenant)?;
        let grant = dto::RefreshTokenGrant {
            refresh_token,
            scope: &self.scope,
            client_id: self.client_id.as_deref(),
        };

        request_token(&self.client, token_url, &grant).await
    }
}

#[async_trait]
impl RefreshSource for OAuth2Refresher {
    type Error = RefreshError;

    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
        tenant: Option<&TenantIdRef>,
    ) -> Result<CredentialPair, Self::Error> {
        self.refresh_token(refresh_token, tenant).await
    }
}

fn maybe_value<'a, T: tracing::Value + 'a>(v: &'a Option<T>) -> &'a dyn tracing::Value {
    if let Some(v) = v {
        v
    } else {
        &tracing::field::Empty
    }
}

#[tracing::instrument(
    err,
    skip(client, token_url, grant),
    fields(
        token_url = %token_url,
        grant.grant_type = "refresh_token",
        grant.scope = grant.scope,
        grant.client_id = maybe_value(&grant.client_id.map(|c| c.as_str())),
    ),
)]
async fn request_token(
    client: &reqwest::Client,
    token_url: Url,
    grant: &dto::RefreshTokenGrant<'_>,
) -> Result<CredentialPair, RefreshError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(token_url)
        .form(grant)
        .send()
        .await
        .map_err(RefreshError::Transport)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from issuing authority"
    );

    let body = resp.bytes().await.map_err(RefreshError::Transport)?;

    if !status.is_success() {
        return Err(RefreshError::from_error_response(status, &body));
    }

    let resp: dto::TokenResponse =
        serde_json::from_slice(&body).map_err(|source| RefreshError::MalformedResponse {
            reason: "body is not a valid token response",
            source: Some(source),
        })?;

    let access_token = resp
        .access_token
        .filter(|t| !t.as_str().is_empty())
        .ok_or(RefreshError::MalformedResponse {
            reason: "response does not contain an access token",
            source: None,
        })?;

    tracing::info!(
        has_refresh_token = resp.refresh_token.is_some(),
        token_type = maybe_value(&resp.token_type.as_deref()),
        lifetime = maybe_value(&resp.expires_in.map(|d| d.0)),
        scope = maybe_value(&resp.scope.as_deref()),
        "received new tokens"
    );

    if resp.refresh_token.is_some() {
        tracing::info!("received new refresh token");
    }

    Ok(CredentialPair::new(access_token, resp.refresh_token))
}
