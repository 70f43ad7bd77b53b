//! End-to-end refresh behavior against a mock API and token authority

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use graft_reqwest::{ClientConfig, Error, RefreshingClient};
use graft_tokens::{
    AccessToken, CredentialPair, OAuth2Refresher, RefreshToken, TenantId, TestClock, UnixTime,
};
use httpmock::prelude::*;
use serde_json::{json, Value};

const NOW: u64 = 1_700_000_000;
const TOKEN_PATH: &str = "/contoso/oauth2/v2.0/token";

fn jwt(exp: u64, marker: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({ "exp": exp, "oid": marker }).to_string());
    format!("{header}.{payload}.c2ln")
}

fn client_for(
    server: &MockServer,
    access_token: &str,
    refresh_token: Option<&str>,
) -> RefreshingClient<OAuth2Refresher, TestClock> {
    let config = ClientConfig::default()
        .with_base_url(server.url("/v1.0"))
        .with_authority(server.base_url())
        .with_tenant(TenantId::from_static("contoso"))
        .allow_insecure_http();
    let credentials = CredentialPair::new(
        AccessToken::from(access_token.to_owned()),
        refresh_token.map(|t| RefreshToken::from(t.to_owned())),
    );

    RefreshingClient::new(credentials, &config)
        .unwrap()
        .with_clock(TestClock::new(UnixTime(NOW)))
}

#[tokio::test]
async fn expired_token_is_refreshed_against_tenant_endpoint() {
    let server = MockServer::start();
    let renewed = jwt(NOW + 3600, "renewed");
    let authority = server.mock(|when, then| {
        when.method(POST)
            .path(TOKEN_PATH)
            .header("content-type", "application/x-www-form-urlencoded")
            .body_includes("grant_type=refresh_token")
            .body_includes("refresh_token=rt-1");
        then.status(200).json_body(json!({
            "access_token": renewed,
            "token_type": "Bearer",
            "expires_in": 3600,
        }));
    });
    let api = server.mock(|when, then| {
        when.method(GET)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {renewed}"));
        then.status(200).json_body(json!({"displayName": "Adele Vance"}));
    });

    let client = client_for(&server, &jwt(NOW - 60, "expired"), Some("rt-1"));
    let me: Value = client.get("/me").await.unwrap();

    authority.assert_calls(1);
    api.assert_calls(1);
    assert_eq!(me["displayName"], "Adele Vance");
}

#[tokio::test]
async fn rotated_refresh_token_is_used_for_next_refresh() {
    let server = MockServer::start();
    let soon = jwt(NOW + 60, "soon");
    let fresh = jwt(NOW + 3600, "fresh");
    let first = server.mock(|when, then| {
        when.method(POST)
            .path(TOKEN_PATH)
            .body_includes("refresh_token=rt-1");
        then.status(200).json_body(json!({
            "access_token": soon,
            "refresh_token": "rt-2",
            "expires_in": 60,
        }));
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path(TOKEN_PATH)
            .body_includes("refresh_token=rt-2");
        then.status(200).json_body(json!({
            "access_token": fresh,
            "expires_in": 3600,
        }));
    });
    let api = server.mock(|when, then| {
        when.method(GET).path("/v1.0/me");
        then.status(200).body("{}");
    });

    let client = client_for(&server, &jwt(NOW - 60, "expired"), Some("rt-1"));
    let _: Value = client.get("/me").await.unwrap();
    let _: Value = client.get("/me").await.unwrap();
    let _: Value = client.get("/me").await.unwrap();

    first.assert_calls(1);
    second.assert_calls(1);
    api.assert_calls(3);
    assert_eq!(client.access_token().await.as_str(), fresh);
}

#[tokio::test]
async fn rejected_token_is_refreshed_and_retried() {
    let server = MockServer::start();
    let revoked = jwt(NOW + 3600, "revoked");
    let renewed = jwt(NOW + 3600, "renewed");
    let authority = server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200).json_body(json!({ "access_token": renewed }));
    });
    let rejected = server.mock(|when, then| {
        when.method(PATCH)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {revoked}"));
        then.status(401).json_body(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Token is revoked"}
        }));
    });
    let accepted = server.mock(|when, then| {
        when.method(PATCH)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {renewed}"))
            .json_body(json!({"jobTitle": "Engineer"}));
        then.status(204);
    });

    let client = client_for(&server, &revoked, Some("rt-1"));
    let updated: Option<Value> = client
        .patch("/me", Some(&json!({"jobTitle": "Engineer"})))
        .await
        .unwrap();

    authority.assert_calls(1);
    rejected.assert_calls(1);
    accepted.assert_calls(1);
    assert_eq!(updated, None);
}

#[tokio::test]
async fn authority_rejection_surfaces_as_refresh_failure() {
    let server = MockServer::start();
    let authority = server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(400).json_body(json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70008: The refresh token has expired",
        }));
    });
    let api = server.mock(|when, then| {
        when.method(GET).path("/v1.0/me");
        then.status(200).body("{}");
    });

    let client = client_for(&server, &jwt(NOW - 60, "expired"), Some("rt-1"));
    let err = client.get::<Value>("/me").await.unwrap_err();

    authority.assert_calls(1);
    api.assert_calls(0);
    assert!(err.requires_new_credentials(), "{err:?}");
    assert!(matches!(err, Error::RefreshFailed(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_refresh() {
    const REQUESTS: usize = 8;

    let server = MockServer::start();
    let renewed = jwt(NOW + 3600, "renewed");
    let authority = server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200)
            .delay(std::time::Duration::from_millis(50))
            .json_body(json!({ "access_token": renewed }));
    });
    let api = server.mock(|when, then| {
        when.method(GET)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {renewed}"));
        then.status(200).body("{}");
    });

    let client = Arc::new(client_for(&server, &jwt(NOW + 30, "soon"), Some("rt-1")));
    let tasks: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get::<Value>("/me").await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    authority.assert_calls(1);
    api.assert_calls(REQUESTS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rejections_share_one_refresh() {
    const REQUESTS: usize = 6;

    let server = MockServer::start();
    let revoked = jwt(NOW + 3600, "revoked");
    let renewed = jwt(NOW + 3600, "renewed");
    let authority = server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200).json_body(json!({ "access_token": renewed }));
    });
    let rejected = server.mock(|when, then| {
        when.method(GET)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {revoked}"));
        then.status(401)
            .delay(std::time::Duration::from_millis(100))
            .json_body(json!({
                "error": {"code": "InvalidAuthenticationToken", "message": "Token is revoked"}
            }));
    });
    let accepted = server.mock(|when, then| {
        when.method(GET)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {renewed}"));
        then.status(200).body("{}");
    });

    let client = Arc::new(client_for(&server, &revoked, Some("rt-1")));
    let tasks: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get::<Value>("/me").await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    authority.assert_calls(1);
    rejected.assert_calls(REQUESTS);
    accepted.assert_calls(REQUESTS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_requests_reuse_a_failed_early_refresh() {
    const REQUESTS: usize = 6;

    let server = MockServer::start();
    let soon = jwt(NOW + 60, "soon");
    let authority = server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(503)
            .delay(std::time::Duration::from_millis(200))
            .body("temporarily unavailable");
    });
    let api = server.mock(|when, then| {
        when.method(GET)
            .path("/v1.0/me")
            .header("authorization", format!("Bearer {soon}"));
        then.status(200).body("{}");
    });

    let client = Arc::new(client_for(&server, &soon, Some("rt-1")));
    let tasks: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get::<Value>("/me").await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    authority.assert_calls(1);
    api.assert_calls(REQUESTS);
    assert_eq!(client.access_token().await.as_str(), soon);
}
