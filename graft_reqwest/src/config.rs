//! Client configuration
//!
//! Configuration is fixed when a client is constructed. It can be assembled
//! in code, starting from [`ClientConfig::default()`], or read from the
//! environment with [`ClientConfig::from_env()`] and [`credentials_from_env()`].

use std::{env, time::Duration};

use graft_tokens::{
    refresh::{DEFAULT_AUTHORITY, DEFAULT_SCOPE},
    AccessToken, ClientId, CredentialPair, OAuth2Refresher, RefreshToken, TenantId, TenantIdRef,
};
use thiserror::Error;
use url::Url;

/// The API that requests are sent to, unless configured otherwise
pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Environment variable holding the access token
pub const ACCESS_TOKEN_VAR: &str = "MS_GRAPH_ACCESS_TOKEN";
/// Environment variable holding the optional refresh token
pub const REFRESH_TOKEN_VAR: &str = "MS_GRAPH_REFRESH_TOKEN";
/// Environment variable holding the optional tenant
pub const TENANT_ID_VAR: &str = "MS_GRAPH_TENANT_ID";
/// Environment variable overriding the API base URL
pub const BASE_URL_VAR: &str = "MS_GRAPH_BASE_URL";

/// An error in the client's configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No access token, or an empty one, was supplied
    #[error("an access token is required")]
    MissingAccessToken,

    /// A URL could not be parsed
    #[error("invalid {what} URL `{url}`")]
    InvalidUrl {
        /// Which URL was being parsed
        what: &'static str,
        /// The rejected value
        url: String,
        /// The underlying parse error
        source: url::ParseError,
    },

    /// The API would receive bearer tokens over plain HTTP
    #[error("refusing to send bearer tokens to `{0}` over plain HTTP")]
    InsecureBaseUrl(String),

    /// An environment variable is not valid unicode
    #[error("environment variable `{0}` is not valid unicode")]
    NotUnicode(&'static str),

    /// The underlying HTTP client could not be constructed
    #[error("unable to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Configuration for an API client
#[derive(Clone, Debug)]
pub struct ClientConfig {
    base_url: String,
    tenant: TenantId,
    authority: String,
    scope: String,
    client_id: Option<ClientId>,
    timeout: Option<Duration>,
    allow_insecure_http: bool,
}

impl Default for ClientConfig {
    /// Default configuration
    ///
    /// Sends requests to Microsoft Graph v1.0 and refreshes tokens against
    /// the `common` tenant with the Graph `.default` scope. No timeout is
    /// applied beyond the transport's own.
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            tenant: TenantId::common(),
            authority: DEFAULT_AUTHORITY.to_owned(),
            scope: DEFAULT_SCOPE.to_owned(),
            client_id: None,
            timeout: None,
            allow_insecure_http: false,
        }
    }
}

impl ClientConfig {
    /// Reads the tenant and base URL from the environment, using defaults for
    /// anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_var)
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&'static str) -> Result<Option<String>, ConfigError>,
    {
        let mut config = Self::default();
        if let Some(tenant) = lookup(TENANT_ID_VAR)? {
            config = config.with_tenant(TenantId::from(tenant));
        }
        if let Some(base_url) = lookup(BASE_URL_VAR)? {
            config = config.with_base_url(base_url);
        }
        Ok(config)
    }

    /// Sets the base URL that request paths are appended to
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the tenant used to scope token refreshes
    ///
    /// An empty tenant is replaced with `common`.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = if tenant.as_str().is_empty() {
            TenantId::common()
        } else {
            tenant
        };
        self
    }

    /// Sets the base URL of the token issuing authority
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    /// Sets the scope requested when refreshing
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Identifies the client to the authority when refreshing
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Applies a timeout to every call, including token refreshes
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Permits a plain `http` base URL
    ///
    /// Intended for local testing only.
    pub fn allow_insecure_http(mut self) -> Self {
        self.allow_insecure_http = true;
        self
    }

    /// The base URL that request paths are appended to
    #[inline]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The tenant used to scope token refreshes
    #[inline]
    pub fn tenant(&self) -> &TenantIdRef {
        &self.tenant
    }

    /// The per-call timeout, if any
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidUrl {
            what: "base",
            url: self.base_url.clone(),
            source,
        })?;

        if url.scheme() != "https" && !self.allow_insecure_http {
            return Err(ConfigError::InsecureBaseUrl(self.base_url.clone()));
        }

        Ok(url)
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().map_err(ConfigError::HttpClient)
    }

    pub(crate) fn refresher(&self, client: reqwest::Client) -> Result<OAuth2Refresher, ConfigError> {
        let authority = Url::parse(&self.authority).map_err(|source| ConfigError::InvalidUrl {
            what: "token authority",
            url: self.authority.clone(),
            source,
        })?;

        let refresher = OAuth2Refresher::new(client, authority).with_scope(self.scope.clone());
        Ok(match &self.client_id {
            Some(client_id) => refresher.with_client_id(client_id.clone()),
            None => refresher,
        })
    }
}

/// Reads the access token and optional refresh token from the environment
pub fn credentials_from_env() -> Result<CredentialPair, ConfigError> {
    credentials_from_lookup(env_var)
}

fn credentials_from_lookup<F>(mut lookup: F) -> Result<CredentialPair, ConfigError>
where
    F: FnMut(&'static str) -> Result<Option<String>, ConfigError>,
{
    let access_token = lookup(ACCESS_TOKEN_VAR)?.ok_or(ConfigError::MissingAccessToken)?;
    let refresh_token = lookup(REFRESH_TOKEN_VAR)?;

    Ok(CredentialPair::new(
        AccessToken::from(access_token),
        refresh_token.map(RefreshToken::from),
    ))
}

/// Empty variables are treated as unset
fn env_var(name: &'static str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(name)),
    }
}
