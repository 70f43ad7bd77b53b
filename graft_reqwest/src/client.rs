//! An API client that keeps its own credentials alive
//!
//! Before each request, the [`RefreshingClient`] inspects its access token.
//! A token that has expired, or will expire soon, is exchanged for a new
//! one first. If the API still answers `401 Unauthorized`, the client
//! refreshes once and retries the request exactly once.
//!
//! Refreshes are serialized: however many requests notice a stale token at
//! the same moment, only one of them talks to the authority, and the rest
//! pick up its result.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use graft_tokens::{
    claims, AccessToken, Clock, CredentialPair, InspectError, OAuth2Refresher, RefreshSource,
    RefreshToken, System, TenantId, TokenClaims, TokenStatus,
};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::{
    config::{self, ClientConfig},
    executor::{decode_optional, decode_required, encode_payload, ApiClient},
    Error,
};

/// An API client that refreshes its access token as needed
///
/// The client can be shared between tasks behind an `Arc`.
#[derive(Debug)]
pub struct RefreshingClient<R = OAuth2Refresher, C = System> {
    executor: ApiClient,
    /// Held for the duration of any refresh
    refresh_token: Mutex<Option<RefreshToken>>,
    /// Incremented under the refresh lock whenever a refresh fails
    failed_refreshes: AtomicU64,
    refresher: R,
    tenant: TenantId,
    clock: C,
}

impl RefreshingClient {
    /// Constructs a client from an initial pair of credentials
    ///
    /// Refreshes are sent to the authority named in `config`, sharing the
    /// same HTTP connection pool as API requests.
    pub fn new(credentials: CredentialPair, config: &ClientConfig) -> Result<Self, Error> {
        let http = config.http_client()?;
        let refresher = config.refresher(http.clone())?;
        let (access_token, refresh_token) = credentials.into_parts();
        let executor = ApiClient::with_http_client(http, access_token, config)?;

        Ok(Self {
            executor,
            refresh_token: Mutex::new(refresh_token),
            failed_refreshes: AtomicU64::new(0),
            refresher,
            tenant: config.tenant().to_owned(),
            clock: System,
        })
    }

    /// Constructs a client from credentials and configuration found in the
    /// environment
    pub fn from_env() -> Result<Self, Error> {
        let credentials = config::credentials_from_env()?;
        let config = ClientConfig::from_env()?;
        Self::new(credentials, &config)
    }
}

impl<R, C> RefreshingClient<R, C> {
    /// Replaces the source of refreshed credentials
    pub fn with_refresher<S>(self, refresher: S) -> RefreshingClient<S, C> {
        RefreshingClient {
            executor: self.executor,
            refresh_token: self.refresh_token,
            failed_refreshes: self.failed_refreshes,
            refresher,
            tenant: self.tenant,
            clock: self.clock,
        }
    }

    /// Replaces the clock used to judge token expiry
    pub fn with_clock<D>(self, clock: D) -> RefreshingClient<R, D> {
        RefreshingClient {
            executor: self.executor,
            refresh_token: self.refresh_token,
            failed_refreshes: self.failed_refreshes,
            refresher: self.refresher,
            tenant: self.tenant,
            clock,
        }
    }

    /// The underlying client, which sends requests without refreshing
    #[inline]
    pub fn executor(&self) -> &ApiClient {
        &self.executor
    }

    /// The current access token
    pub async fn access_token(&self) -> AccessToken {
        self.executor.access_token().await
    }

    /// Whether a refresh token is available
    ///
    /// Waits for any refresh in progress.
    pub async fn has_refresh_token(&self) -> bool {
        self.refresh_token.lock().await.is_some()
    }
}

impl<R, C> RefreshingClient<R, C>
where
    R: RefreshSource,
    C: Clock + Send + Sync,
{
    /// Inspects the current access token
    pub async fn token_claims(&self) -> Result<TokenClaims, InspectError> {
        let token = self.executor.access_token().await;
        claims::inspect_with_clock(&token, &self.clock)
    }

    /// Refreshes the access token now, regardless of its expiry
    pub async fn refresh(&self) -> Result<(), Error> {
        let mut refresh_token = self.refresh_token.lock().await;
        match self.renew(&mut refresh_token).await {
            Some(result) => result.map_err(|err| Error::RefreshFailed(Box::new(err))),
            None => Err(Error::AuthExpired {
                reason: "no refresh token is available",
                source: None,
            }),
        }
    }

    /// Sends a request and returns the raw body of a successful response
    pub async fn send<B>(&self, method: Method, path: &str, payload: Option<&B>) -> Result<Bytes, Error>
    where
        B: Serialize + ?Sized,
    {
        let body = encode_payload(payload)?;
        self.execute(method, path, body).await
    }

    /// Sends a `GET` request and decodes the response
    pub async fn get<T>(&self, path: &str) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        decode_required(&self.execute(Method::GET, path, None).await?)
    }

    /// Sends a `POST` request, decoding the response if it has a body
    pub async fn post<B, T>(&self, path: &str, payload: Option<&B>) -> Result<Option<T>, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode_optional(&self.send(Method::POST, path, payload).await?)
    }

    /// Sends a `PATCH` request, decoding the response if it has a body
    pub async fn patch<B, T>(&self, path: &str, payload: Option<&B>) -> Result<Option<T>, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode_optional(&self.send(Method::PATCH, path, payload).await?)
    }

    /// Sends a `DELETE` request, discarding any response body
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        self.execute(Method::DELETE, path, None).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn execute(&self, method: Method, path: &str, body: Option<Bytes>) -> Result<Bytes, Error> {
        self.ensure_fresh().await?;

        let first = self
            .executor
            .exchange(method.clone(), path, body.clone())
            .await?;
        let rejected = first.attached_token().cloned();
        let unauthorized = match first.into_body() {
            Err(err) if err.is_unauthorized() => err,
            other => return other,
        };

        tracing::debug!("request was unauthorized");
        self.recover(rejected, unauthorized).await?;

        match self.executor.exchange(method, path, body).await?.into_body() {
            Err(err) if err.is_unauthorized() => Err(Error::AuthExpired {
                reason: "request was still unauthorized after refreshing",
                source: Some(Box::new(err)),
            }),
            other => other,
        }
    }

    /// Refreshes ahead of a request if the token has expired or expires soon
    async fn ensure_fresh(&self) -> Result<(), Error> {
        let status = self.current_status().await;
        if let Ok(status) = &status {
            tracing::trace!(token.status = ?status, "checked access token");
        }
        if matches!(status, Ok(TokenStatus::Fresh)) {
            return Ok(());
        }

        let failures_before_wait = self.failed_refreshes.load(Ordering::Acquire);
        let mut refresh_token = self.refresh_token.lock().await;

        // Another request may have refreshed while this one waited
        let status = match self.current_status().await {
            Ok(TokenStatus::Fresh) => return Ok(()),
            Ok(status) => Some(status),
            Err(err) if refresh_token.is_none() => return Err(Error::Unrefreshable(err)),
            Err(err) => {
                tracing::debug!(error = %err, "access token cannot be inspected");
                None
            }
        };

        if status == Some(TokenStatus::ExpiringSoon)
            && self.failed_refreshes.load(Ordering::Acquire) != failures_before_wait
        {
            tracing::debug!("refresh failed while waiting; continuing with current token");
            return Ok(());
        }

        match self.renew(&mut refresh_token).await {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) if status == Some(TokenStatus::ExpiringSoon) => {
                tracing::warn!(
                    error = %err,
                    "unable to refresh access token before it expires; continuing with current token"
                );
                Ok(())
            }
            Some(Err(err)) => Err(Error::RefreshFailed(Box::new(err))),
            None if status == Some(TokenStatus::ExpiringSoon) => {
                tracing::debug!("access token expires soon, but no refresh token is available");
                Ok(())
            }
            None => Err(Error::AuthExpired {
                reason: "access token has expired and no refresh token is available",
                source: None,
            }),
        }
    }

    /// Refreshes after the API rejected `rejected`, unless a concurrent
    /// request has already replaced it
    async fn recover(&self, rejected: Option<AccessToken>, unauthorized: Error) -> Result<(), Error> {
        let mut refresh_token = self.refresh_token.lock().await;

        if refresh_token.is_none() {
            return Err(Error::AuthExpired {
                reason: "request was unauthorized and no refresh token is available",
                source: Some(Box::new(unauthorized)),
            });
        }

        if let Some(rejected) = rejected {
            if rejected != self.executor.access_token().await {
                tracing::debug!("access token was already replaced; retrying with the new token");
                return Ok(());
            }
        }

        match self.renew(&mut refresh_token).await {
            Some(Ok(())) | None => Ok(()),
            Some(Err(err)) => Err(Error::RefreshFailed(Box::new(err))),
        }
    }

    async fn current_status(&self) -> Result<TokenStatus, InspectError> {
        self.token_claims().await.map(|c| c.status())
    }

    /// Exchanges the refresh token held under the refresh lock
    ///
    /// Returns `None` if there is no refresh token. On success the access
    /// token is replaced, as is the refresh token if the authority rotated it.
    async fn renew(&self, slot: &mut Option<RefreshToken>) -> Option<Result<(), R::Error>> {
        let refresh_token = slot.as_deref()?;

        let credentials = match self.refresher.refresh(refresh_token, Some(&*self.tenant)).await {
            Ok(credentials) => credentials,
            Err(err) => {
                self.failed_refreshes.fetch_add(1, Ordering::AcqRel);
                return Some(Err(err));
            }
        };

        let (access_token, rotated) = credentials.into_parts();
        self.executor.set_access_token(access_token).await;
        if let Some(rotated) = rotated {
            tracing::debug!("replacing rotated refresh token");
            *slot = Some(rotated);
        }

        Some(Ok(()))
    }
}
