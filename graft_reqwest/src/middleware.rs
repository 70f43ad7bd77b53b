//! Middleware to attach the current access token to outgoing requests
//!
//! The [`AccessTokenMiddleware`] reads from a shared [`TokenCell`] on every
//! request, so a token replaced after a refresh is used by the very next
//! request sent through the stack.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use graft_reqwest::middleware::{AccessTokenMiddleware, TokenCell};
//! use graft_tokens::AccessToken;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let cell = TokenCell::new(AccessToken::from_static("token"));
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(cell.clone()))
//!     .build();
//! # drop(client);
//! ```

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use graft_tokens::{AccessToken, AccessTokenRef};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Request, Response,
};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;
use tokio::sync::RwLock;
use url::{Origin, Url};

/// The current access token, shared between a client and its middleware
///
/// Readers proceed concurrently; replacing the token waits for in-flight
/// readers and blocks new ones until the swap is complete.
#[derive(Clone, Debug)]
pub struct TokenCell(Arc<RwLock<AccessToken>>);

impl TokenCell {
    /// Constructs a new cell holding `token`
    pub fn new(token: AccessToken) -> Self {
        Self(Arc::new(RwLock::new(token)))
    }

    /// Gets a copy of the current token
    pub async fn get(&self) -> AccessToken {
        self.0.read().await.clone()
    }

    /// Replaces the current token
    pub async fn replace(&self, token: AccessToken) {
        *self.0.write().await = token;
    }
}

/// The access token that the middleware attached to a request
///
/// Inserted into the request extensions so that a caller can tell which
/// token an unauthorized response was answering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachedToken(pub AccessToken);

/// The access token cannot be expressed as a header value
#[derive(Debug, Error)]
#[error("access token contains bytes that are not valid in a header")]
pub struct InvalidAccessToken(#[source] InvalidHeaderValue);

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    token: TokenCell,
    predicate: P,
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a token cell
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(token: TokenCell) -> Self {
        Self {
            token,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            token: self.token,
            predicate,
        }
    }
}

fn bearer_header(token: &AccessTokenRef) -> std::result::Result<HeaderValue, InvalidAccessToken> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = HeaderValue::from_maybe_shared(header_value).map_err(InvalidAccessToken)?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let token = self.token.get().await;

            tracing::trace!(url = %req.url(), "attaching access token");
            let value = bearer_header(&token).map_err(reqwest_middleware::Error::middleware)?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
            extensions.insert(AttachedToken(token));
        }

        next.run(req, extensions).await
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request shares the scheme, host, and
/// port of a given URL
#[derive(Clone, Debug)]
pub struct SameOrigin {
    origin: Origin,
}

impl SameOrigin {
    /// Construct a new predicate matching the origin of `url`
    pub fn of(url: &Url) -> Self {
        Self {
            origin: url.origin(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.origin.is_tuple() && req.url().origin() == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin == ")?;
        f.write_str(&self.origin.ascii_serialization())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";

    struct AuthChecker {
        expected_authorization: String,
        expected_attached: Option<AccessToken>,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                expected_attached: Some(AccessToken::from_static(TEST_TOKEN)),
                checked: AtomicBool::new(false),
            }
        }

        pub fn without_attached_token(mut self) -> Self {
            self.expected_attached = None;
            self
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            extensions: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            assert_eq!(
                extensions.get::<AttachedToken>().map(|t| t.0.clone()),
                self.expected_attached
            );
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            extensions: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            assert!(extensions.get::<AttachedToken>().is_none());
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    fn prepare_middleware() -> (TokenCell, AccessTokenMiddleware<HttpsOnly>) {
        let cell = TokenCell::new(AccessToken::from_static(TEST_TOKEN));
        (cell.clone(), AccessTokenMiddleware::new(cell))
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_on_https_request() {
            let (_, middleware) = prepare_middleware();
            let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn middleware_with_defaults_does_not_attach_token_on_http_request() {
            let (_, middleware) = prepare_middleware();
            let auth_checker = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client.get("http://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn replaced_token_is_used_by_next_request() {
            let (cell, middleware) = prepare_middleware();
            cell.replace(AccessToken::from_static("a-newer-token")).await;

            let mut checker = AuthChecker::new("Bearer a-newer-token");
            checker.expected_attached = Some(AccessToken::from_static("a-newer-token"));
            let auth_checker = Arc::new(checker);

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            client.get("https://example.com").send().await.unwrap();

            assert!(auth_checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn token_with_invalid_header_bytes_fails_request() {
            let cell = TokenCell::new(AccessToken::from_static("bad\ntoken"));
            let client = ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(cell))
                .with(NoAuthChecker::default())
                .build();

            let err = client.get("https://example.com").send().await.unwrap_err();

            assert!(matches!(err, reqwest_middleware::Error::Middleware(_)), "{err:?}");
        }

        mod and_predicate_evaluates_to_attach {
            use super::*;

            #[tokio::test]
            async fn middleware_attaches_access_token() {
                let (_, middleware) = prepare_middleware();
                let middleware = middleware.with_predicate(predicate::always());
                let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("http://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token() {
                let (_, middleware) = prepare_middleware();
                let middleware = middleware.with_predicate(predicate::never());
                let auth_checker = Arc::new(NoAuthChecker::default());

                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(auth_checker.clone())
                    .build();

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(auth_checker.checked.load(Ordering::Acquire));
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            let (_, middleware) = prepare_middleware();
            let auth_checker =
                Arc::new(AuthChecker::new("Bearer overridden!").without_attached_token());

            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(auth_checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(auth_checker.checked.load(Ordering::Acquire));
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(true, &request);
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(false, &request);
            assert!(result.is_none())
        }
    }

    mod same_origin_predicate {
        use super::*;

        fn predicate() -> SameOrigin {
            SameOrigin::of(&"https://graph.example.com/v1.0".parse().unwrap())
        }

        #[test]
        fn matches_any_path_on_same_origin() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://graph.example.com/beta/me".parse().unwrap(),
            );
            assert!(predicate().eval(&request));
        }

        #[test]
        fn does_not_match_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://does-not-match.com/v1.0/me".parse().unwrap(),
            );
            assert!(predicate().find_case(false, &request).is_none());
        }

        #[test]
        fn does_not_match_different_scheme_or_port() {
            let http = Request::new(
                reqwest::Method::GET,
                "http://graph.example.com/v1.0/me".parse().unwrap(),
            );
            let port = Request::new(
                reqwest::Method::GET,
                "https://graph.example.com:8443/v1.0/me".parse().unwrap(),
            );
            assert!(!predicate().eval(&http));
            assert!(!predicate().eval(&port));
        }

        #[test]
        fn displays_origin() {
            assert_eq!(predicate().to_string(), "origin == https://graph.example.com");
        }
    }
}
