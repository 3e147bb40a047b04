//! In-process HTTP tests for the OAuth router.
//!
//! ```bash
//! cargo test -p calcplane-oauth --features testutil --test http_api
//! ```
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use calcplane_control::{FixedWindowLimiter, ManualClock, RateLimitConfig};
use calcplane_oauth::{
    BridgeConfig, OAuthState, TokenBridge, oauth_router,
    testutil::{StaticTokenValidator, pkce_pair},
};
use calcplane_storage::MemoryStore;
use serde_json::{Value, json};
use tower::ServiceExt;

const INTERNAL_TOKEN: &str = "cpt_internal_0000001";
const REDIRECT_URI: &str = "http://127.0.0.1:9000/cb";

struct TestApp {
    router: Router,
    bridge: Arc<TokenBridge>,
}

fn test_app(config: BridgeConfig) -> TestApp {
    let validator =
        StaticTokenValidator::new().with_token(INTERNAL_TOKEN, "alice", ["service:mortgage"]);
    let bridge =
        Arc::new(TokenBridge::new(Arc::new(MemoryStore::new()), Arc::new(validator), config).unwrap());
    TestApp { router: oauth_router(OAuthState::new(Arc::clone(&bridge))), bridge }
}

struct TestResponse {
    status: StatusCode,
    headers: axum::http::HeaderMap,
    body: Value,
}

async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    TestResponse { status, headers, body }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn post_form(uri: &str, body: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(body).unwrap()))
        .unwrap()
}

fn authorize_body(client_id: &str, challenge: &str) -> Value {
    json!({
        "client_id": client_id,
        "redirect_uri": REDIRECT_URI,
        "code_challenge": challenge,
        "code_challenge_method": "S256",
        "tokens": [INTERNAL_TOKEN],
        "state": "xyz"
    })
}

fn from_address(mut request: Request<Body>, address: &str) -> Request<Body> {
    request.headers_mut().insert("x-forwarded-for", address.parse().unwrap());
    request
}

fn limited_config(max_requests: u32) -> BridgeConfig {
    BridgeConfig::builder()
        .rate_limit(
            RateLimitConfig::builder()
                .window(Duration::from_secs(3600))
                .max_requests(max_requests)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

async fn authorize(router: &Router, challenge: &str) -> TestResponse {
    send(
        router,
        post_json(
            "/oauth/authorize",
            &json!({
                "client_id": "agent-cli",
                "redirect_uri": REDIRECT_URI,
                "code_challenge": challenge,
                "code_challenge_method": "S256",
                "tokens": [INTERNAL_TOKEN],
                "state": "xyz"
            }),
        ),
    )
    .await
}

#[tokio::test]
async fn authorize_then_form_encoded_token_exchange() {
    let app = test_app(BridgeConfig::default());
    let (verifier, challenge) = pkce_pair();

    let authorized = authorize(&app.router, &challenge).await;
    assert_eq!(authorized.status, StatusCode::OK);
    assert_eq!(authorized.body["state"], "xyz");
    let code = authorized.body["code"].as_str().unwrap().to_owned();

    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("client_id", "agent-cli"),
        ("redirect_uri", REDIRECT_URI),
        ("code_verifier", verifier.as_str()),
    ];
    let issued = send(&app.router, post_form("/oauth/token", &form)).await;
    assert_eq!(issued.status, StatusCode::OK);
    assert_eq!(issued.body["token_type"], "Bearer");
    assert_eq!(issued.body["expires_in"], 86_400);
    assert_eq!(issued.body["scope"], "service:mortgage");
    assert_eq!(issued.headers.get(header::CACHE_CONTROL).unwrap(), "no-store");

    let access_token = issued.body["access_token"].as_str().unwrap();
    let resolved = app.bridge.resolve(access_token).await.unwrap().unwrap();
    assert_eq!(resolved.internal_tokens, vec![INTERNAL_TOKEN.to_owned()]);

    let replay = send(&app.router, post_form("/oauth/token", &form)).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.body["error"], "invalid_grant");
}

#[tokio::test]
async fn json_token_exchange_with_wrong_verifier() {
    let app = test_app(BridgeConfig::default());
    let (_, challenge) = pkce_pair();
    let (wrong, _) = pkce_pair();
    let code = authorize(&app.router, &challenge).await.body["code"].as_str().unwrap().to_owned();

    let response = send(
        &app.router,
        post_json(
            "/oauth/token",
            &json!({
                "grant_type": "authorization_code",
                "code": code,
                "client_id": "agent-cli",
                "redirect_uri": REDIRECT_URI,
                "code_verifier": wrong
            }),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "invalid_grant");
    assert!(response.body["error_description"].is_string());
}

#[tokio::test]
async fn authorize_errors_use_oauth_error_body() {
    let app = test_app(BridgeConfig::default());
    let (_, challenge) = pkce_pair();

    let response = send(
        &app.router,
        post_json(
            "/oauth/authorize",
            &json!({
                "client_id": "agent-cli",
                "redirect_uri": REDIRECT_URI,
                "code_challenge": challenge,
                "tokens": ["cpt_unknown_token_000"]
            }),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "invalid_request");

    let response = send(
        &app.router,
        Request::builder()
            .method(Method::POST)
            .uri("/oauth/authorize")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "invalid_request");
}

#[tokio::test]
async fn unsupported_grant_type() {
    let app = test_app(BridgeConfig::default());
    let response =
        send(&app.router, post_form("/oauth/token", &[("grant_type", "password")])).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn authorize_is_rate_limited_per_caller() {
    let app = test_app(limited_config(2));
    let (_, challenge) = pkce_pair();

    for _ in 0..2 {
        assert_eq!(authorize(&app.router, &challenge).await.status, StatusCode::OK);
    }
    let limited = authorize(&app.router, &challenge).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["error"], "rate_limited");
    let retry_after: u64 =
        limited.headers.get(header::RETRY_AFTER).unwrap().to_str().unwrap().parse().unwrap();
    assert!((1..=3600).contains(&retry_after));
}

#[tokio::test]
async fn rotating_client_ids_share_the_caller_budget() {
    let app = test_app(limited_config(2));
    let (_, challenge) = pkce_pair();

    let mut statuses = Vec::new();
    for i in 0..4 {
        let request = post_json("/oauth/authorize", &authorize_body(&format!("client-{i}"), &challenge));
        statuses.push(send(&app.router, from_address(request, "203.0.113.7")).await.status);
    }
    assert_eq!(statuses[..2], [StatusCode::OK, StatusCode::OK]);
    assert_eq!(statuses[2..], [StatusCode::TOO_MANY_REQUESTS, StatusCode::TOO_MANY_REQUESTS]);

    let other = post_json("/oauth/authorize", &authorize_body("client-0", &challenge));
    assert_eq!(send(&app.router, from_address(other, "198.51.100.4")).await.status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_bodies_count_against_the_budget() {
    let app = test_app(limited_config(2));
    let garbage = || {
        Request::builder()
            .method(Method::POST)
            .uri("/oauth/token")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap()
    };

    for _ in 0..2 {
        let response = send(&app.router, garbage()).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["error"], "invalid_request");
    }
    assert_eq!(send(&app.router, garbage()).await.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn ended_windows_are_pruned_as_callers_arrive() {
    let clock = Arc::new(ManualClock::new(0));
    let limiter = Arc::new(
        FixedWindowLimiter::with_clock(clock.clone()).with_prune_interval(Duration::from_secs(60)),
    );
    let config = BridgeConfig::default();
    let window = config.rate_limit().window();
    let app = test_app(config);
    let router = oauth_router(
        OAuthState::new(Arc::clone(&app.bridge)).with_limiter(limiter.clone()),
    );

    for i in 0..200 {
        let request = post_form("/oauth/revoke", &[("token", "cpt_unknown")]);
        let response = send(&router, from_address(request, &format!("10.0.{}.{}", i / 256, i % 256))).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(limiter.tracked_windows(), 200);

    clock.advance_ms(i64::try_from(window.as_millis()).unwrap() + 60_000);
    let request = post_form("/oauth/revoke", &[("token", "cpt_unknown")]);
    send(&router, from_address(request, "10.1.0.1")).await;
    assert_eq!(limiter.tracked_windows(), 1);
}

#[tokio::test]
async fn register_returns_created() {
    let app = test_app(BridgeConfig::default());
    let response = send(
        &app.router,
        post_json(
            "/oauth/register",
            &json!({
                "client_name": "Research agent",
                "redirect_uris": ["https://agent.example.com/cb"],
                "scope": "ignored extension field"
            }),
        ),
    )
    .await;
    assert_eq!(response.status, StatusCode::CREATED);
    let client_id = response.body["client_id"].as_str().unwrap();
    assert!(client_id.starts_with("cpc_"));
    assert_eq!(response.body["token_endpoint_auth_method"], "none");
    assert!(app.bridge.clients().get(client_id).await.unwrap().is_some());

    let rejected = send(
        &app.router,
        post_json("/oauth/register", &json!({ "redirect_uris": ["http://agent.example.com/cb"] })),
    )
    .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.body["error"], "invalid_redirect_uri");
}

#[tokio::test]
async fn revoke_is_idempotent() {
    let app = test_app(BridgeConfig::default());
    let (verifier, challenge) = pkce_pair();
    let code = authorize(&app.router, &challenge).await.body["code"].as_str().unwrap().to_owned();
    let issued = send(
        &app.router,
        post_form(
            "/oauth/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("client_id", "agent-cli"),
                ("redirect_uri", REDIRECT_URI),
                ("code_verifier", verifier.as_str()),
            ],
        ),
    )
    .await;
    let access_token = issued.body["access_token"].as_str().unwrap().to_owned();

    for _ in 0..2 {
        let response =
            send(&app.router, post_form("/oauth/revoke", &[("token", access_token.as_str())])).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert!(app.bridge.resolve(&access_token).await.unwrap().is_none());

    let missing = send(&app.router, post_json("/oauth/revoke", &json!({}))).await;
    assert_eq!(missing.body["error"], "invalid_request");
}

#[tokio::test]
async fn metadata_advertises_endpoints() {
    let config = BridgeConfig::builder().issuer("https://calc.example.com".into()).build().unwrap();
    let app = test_app(config);
    let response = send(
        &app.router,
        Request::builder()
            .uri("/.well-known/oauth-authorization-server")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["issuer"], "https://calc.example.com");
    assert_eq!(response.body["token_endpoint"], "https://calc.example.com/oauth/token");
    assert_eq!(response.body["code_challenge_methods_supported"], json!(["S256"]));
}
