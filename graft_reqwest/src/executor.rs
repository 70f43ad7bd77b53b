//! Sends authenticated JSON requests against a base URL
//!
//! The [`ApiClient`] knows nothing about refreshing. It attaches whatever
//! access token is current, sends the request, and maps the response.

use std::{fmt, time::Duration};

use bytes::Bytes;
use graft_tokens::AccessToken;
use reqwest::{header, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::{ClientConfig, ConfigError},
    middleware::{AccessTokenMiddleware, AttachedToken, InvalidAccessToken, SameOrigin, TokenCell},
    Error,
};

const APPLICATION_JSON: &str = "application/json";

/// An API client that authenticates with a single, replaceable access token
#[derive(Clone)]
pub struct ApiClient {
    client: ClientWithMiddleware,
    base_url: String,
    token: TokenCell,
    timeout: Option<Duration>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A response as received, before its status is interpreted
#[derive(Debug)]
pub(crate) struct Exchange {
    status: StatusCode,
    body: Bytes,
    attached: Option<AccessToken>,
}

impl Exchange {
    /// The token the request carried, if the middleware attached one
    #[inline]
    pub(crate) fn attached_token(&self) -> Option<&AccessToken> {
        self.attached.as_ref()
    }

    pub(crate) fn into_body(self) -> Result<Bytes, Error> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(Error::from_response(self.status, &self.body))
        }
    }
}

impl ApiClient {
    /// Constructs a new client that sends `access_token` to the configured API
    pub fn new(access_token: AccessToken, config: &ClientConfig) -> Result<Self, Error> {
        let http = config.http_client()?;
        Self::with_http_client(http, access_token, config)
    }

    /// Constructs a new client on top of an existing HTTP client
    pub fn with_http_client(
        http: reqwest::Client,
        access_token: AccessToken,
        config: &ClientConfig,
    ) -> Result<Self, Error> {
        if access_token.as_str().is_empty() {
            return Err(ConfigError::MissingAccessToken.into());
        }

        let base_url = config.parsed_base_url()?;
        let token = TokenCell::new(access_token);
        let client = ClientBuilder::new(http)
            .with(AccessTokenMiddleware::new(token.clone()).with_predicate(SameOrigin::of(&base_url)))
            .build();

        Ok(Self {
            client,
            base_url: config.base_url().to_owned(),
            token,
            timeout: config.timeout(),
        })
    }

    /// The current access token
    pub async fn access_token(&self) -> AccessToken {
        self.token.get().await
    }

    /// Replaces the access token used by subsequent requests
    pub async fn set_access_token(&self, token: AccessToken) {
        self.token.replace(token).await;
    }

    /// Sends a request and returns the raw body of a successful response
    ///
    /// `path` is appended verbatim to the base URL. A `payload`, if given,
    /// is serialized as JSON.
    pub async fn send<B>(&self, method: Method, path: &str, payload: Option<&B>) -> Result<Bytes, Error>
    where
        B: Serialize + ?Sized,
    {
        let body = encode_payload(payload)?;
        self.exchange(method, path, body).await?.into_body()
    }

    /// Sends a `GET` request and decodes the response
    pub async fn get<T>(&self, path: &str) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        decode_required(&self.send::<()>(Method::GET, path, None).await?)
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
        self.send::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, body),
        fields(status = tracing::field::Empty, body.len = body.as_ref().map_or(0, Bytes::len))
    )]
    pub(crate) async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Exchange, Error> {
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self
            .client
            .request(method, &url)
            .header(header::CONTENT_TYPE, APPLICATION_JSON);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let request = builder
            .build()
            .map_err(|err| Error::InvalidRequest(Box::new(err)))?;

        let mut extensions = http::Extensions::new();
        let response = self
            .client
            .execute_with_extensions(request, &mut extensions)
            .await
            .map_err(unsent_or_transport)?;

        let status = response.status();
        tracing::Span::current().record("status", status.as_u16());

        let body = response
            .bytes()
            .await
            .map_err(|err| Error::Transport(err.into()))?;

        Ok(Exchange {
            status,
            body,
            attached: extensions.remove::<AttachedToken>().map(|t| t.0),
        })
    }
}

/// A token that cannot be written into a header stops the request before it
/// is sent
fn unsent_or_transport(err: reqwest_middleware::Error) -> Error {
    match err {
        reqwest_middleware::Error::Middleware(err) => match err.downcast::<InvalidAccessToken>() {
            Ok(invalid) => Error::InvalidRequest(Box::new(invalid)),
            Err(err) => Error::Transport(reqwest_middleware::Error::Middleware(err)),
        },
        err => Error::Transport(err),
    }
}

pub(crate) fn encode_payload<B>(payload: Option<&B>) -> Result<Option<Bytes>, Error>
where
    B: Serialize + ?Sized,
{
    payload
        .map(|p| {
            serde_json::to_vec(p)
                .map(Bytes::from)
                .map_err(|err| Error::InvalidRequest(Box::new(err)))
        })
        .transpose()
}

pub(crate) fn decode_required<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(Error::Decode)
}

pub(crate) fn decode_optional<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, Error> {
    if body.is_empty() {
        Ok(None)
    } else {
        decode_required(body).map(Some)
    }
}
