//! Integration tests for the adapter core
//!
//! Uses wiremock to stand in for the upstream API: conditional requests,
//! app-auth assertions, rate-limit feedback, pagination, and webhook
//! replay are exercised end to end.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mesh_adapter::adapter::MeshAdapter;
use mesh_adapter::auth::RequestContext;
use mesh_adapter::graphql::PaginationOptions;
use mesh_adapter::webhook::validator::sign_payload;
use mesh_adapter::webhook::WebhookEvent;
use mesh_adapter::{Config, ErrorKind};

const APP_KEY: &str = include_str!("../src/auth/testdata/test_app_key.pem");
const APP_PUB: &str = include_str!("../src/auth/testdata/test_app_key.pub.pem");

fn test_config(server: &MockServer) -> Config {
    Config {
        api_base_url: server.uri(),
        graphql_url: format!("{}/graphql", server.uri()),
        auth_mode: "token".to_string(),
        api_token: Some("test-token".to_string()),
        requests_per_second: 1_000.0,
        burst: 1_000,
        max_retries: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn conditional_get_serves_cached_value_on_304() {
    let server = MockServer::start().await;

    // First fetch: full body with a validator.
    Mock::given(method("GET"))
        .and(path("/repos/octo/mesh"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .set_body_json(json!({"name": "mesh", "stars": 42})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let adapter = MeshAdapter::new(Arc::new(test_config(&server))).await.unwrap();
    let ctx = RequestContext::new();

    let first: serde_json::Value = adapter.rest().get(&ctx, "/repos/octo/mesh").await.unwrap();
    assert_eq!(first["stars"], 42);

    // Second fetch: the validator goes up, 304 comes back, the cached
    // value is returned verbatim.
    Mock::given(method("GET"))
        .and(path("/repos/octo/mesh"))
        .and(header("If-None-Match", "\"abc\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let second: serde_json::Value = adapter.rest().get(&ctx, "/repos/octo/mesh").await.unwrap();
    assert_eq!(second, first);

    adapter.close().await;
}

#[tokio::test]
async fn app_auth_sends_signed_assertion() {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    #[derive(serde::Deserialize)]
    struct Claims {
        iat: i64,
        exp: i64,
        iss: String,
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 12345})))
        .mount(&server)
        .await;

    let config = Config {
        auth_mode: "app".to_string(),
        api_token: None,
        app_id: Some("12345".to_string()),
        app_private_key: Some(APP_KEY.to_string()),
        ..test_config(&server)
    };

    let adapter = MeshAdapter::new(Arc::new(config)).await.unwrap();
    let _: serde_json::Value = adapter
        .rest()
        .get(&RequestContext::new(), "/app")
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0]
        .headers
        .get("authorization")
        .expect("authorization header present")
        .to_str()
        .unwrap();
    let assertion = auth.strip_prefix("Bearer ").expect("bearer scheme");

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&["12345"]);
    let decoded = decode::<Claims>(
        assertion,
        &DecodingKey::from_rsa_pem(APP_PUB.as_bytes()).unwrap(),
        &validation,
    )
    .unwrap();

    assert_eq!(decoded.claims.iss, "12345");
    assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);

    adapter.close().await;
}

#[tokio::test]
async fn rate_limit_headers_adapt_the_limiter() {
    let server = MockServer::start().await;
    let reset = chrono::Utc::now().timestamp() + 60;

    Mock::given(method("GET"))
        .and(path("/rate-limited"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Limit", "5000")
                .insert_header("X-RateLimit-Remaining", "400")
                .insert_header("X-RateLimit-Reset", reset.to_string().as_str())
                .insert_header("X-RateLimit-Used", "4600")
                .set_body_json(json!({})),
        )
        .mount(&server)
        .await;

    let config = Config {
        requests_per_second: 10.0,
        ..test_config(&server)
    };
    let adapter = MeshAdapter::new(Arc::new(config)).await.unwrap();

    let _: serde_json::Value = adapter
        .rest()
        .get(&RequestContext::new(), "/rate-limited")
        .await
        .unwrap();

    // 400 remaining / 60s * 0.9, scaled down for 92% usage.
    let effective = adapter.rate_limiter().effective_rate();
    assert!(effective < 6.0, "effective = {}", effective);
    assert!(effective <= 4.0, "effective = {}", effective);

    let state = adapter.rate_limiter().state();
    assert_eq!(state.snapshot.unwrap().remaining, 400);

    adapter.close().await;
}

#[tokio::test]
async fn paginated_query_walks_cursors() {
    let server = MockServer::start().await;

    // Page 2: matched by the cursor variable; mounted first so it wins
    // when it matches.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("XYZ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "repository": {
                    "issues": {
                        "nodes": [{"number": 2}],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    }
                }
            }
        })))
        .mount(&server)
        .await;

    // Page 1.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "repository": {
                    "issues": {
                        "nodes": [{"number": 1}],
                        "pageInfo": {"hasNextPage": true, "endCursor": "XYZ"}
                    }
                }
            }
        })))
        .mount(&server)
        .await;

    let adapter = MeshAdapter::new(Arc::new(test_config(&server))).await.unwrap();

    let mut pages = Vec::new();
    let count = adapter
        .graphql()
        .query_paginated(
            &RequestContext::new(),
            "query($first: Int!, $after: String) { repository { issues(first: $first, after: $after) { nodes { number } pageInfo { hasNextPage endCursor } } } }",
            json!({}),
            &PaginationOptions {
                items_field: Some("issues".to_string()),
                ..Default::default()
            },
            |page| {
                pages.push(page);
                Ok(())
            },
        )
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(pages.len(), 2);

    // The second request's variables carried the cursor.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second_body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(second_body["variables"]["after"], "XYZ");

    adapter.close().await;
}

#[tokio::test]
async fn error_envelope_becomes_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Not Found",
            "documentation_url": "https://docs.github.com/rest"
        })))
        .mount(&server)
        .await;

    let adapter = MeshAdapter::new(Arc::new(test_config(&server))).await.unwrap();

    let err = adapter
        .rest()
        .get::<serde_json::Value>(&RequestContext::new(), "/missing")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.message, "Not Found");
    assert_eq!(err.status_code(), Some(404));

    adapter.close().await;
}

#[tokio::test]
async fn webhook_replay_is_rejected() {
    let server = MockServer::start().await;
    let config = Config {
        webhook_secret: Some("intake-secret".to_string()),
        webhook_workers: 1,
        ..test_config(&server)
    };
    let adapter = MeshAdapter::new(Arc::new(config)).await.unwrap();

    let payload = br#"{"action": "opened"}"#.to_vec();
    let signature = sign_payload(b"intake-secret", &payload);

    let first = WebhookEvent::new("pull_request", "D1", payload.clone());
    adapter.handle_webhook(first, &signature, None).await.unwrap();

    let replayed = WebhookEvent::new("pull_request", "D1", payload);
    let err = adapter
        .handle_webhook(replayed, &signature, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReplayDetected);

    adapter.close().await;
}

#[tokio::test]
async fn upstream_5xx_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let config = Config {
        max_retries: 3,
        initial_retry_delay_ms: 1,
        ..test_config(&server)
    };
    let adapter = MeshAdapter::new(Arc::new(config)).await.unwrap();

    let value: serde_json::Value = adapter
        .rest()
        .get(&RequestContext::new(), "/flaky")
        .await
        .unwrap();
    assert_eq!(value["ok"], true);

    adapter.close().await;
}
