//! Shared helpers for the HTTP integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tally_api::{AppState, config::ApiConfig};
use tally_core::auth::config::HashingParams;
use tally_core::auth::notify::MemoryNotifier;
use tally_core::models::{OneTimePurpose, TenantId};
use tally_core::store::{MemoryStore, Stores};
use tally_core::tenancy::MemoryBackend;
use tower::ServiceExt;

pub const PASSWORD: &str = "Correct-horse-9";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotifier>,
}

pub fn app() -> TestApp {
    app_with(&[])
}

/// Build an in-memory app; `vars` override the test environment.
pub fn app_with(vars: &[(&str, &str)]) -> TestApp {
    let mut env = vec![
        ("JWT_SECRET", "integration-secret"),
        ("TRUST_FORWARDED_FOR", "true"),
        ("RATE_LIMIT_PER_MINUTE", "1000"),
    ];
    env.extend_from_slice(vars);
    let mut config = ApiConfig::from_lookup(|key| {
        env.iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .expect("test config");
    config.auth.hashing = HashingParams::light();

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let state = AppState::new(
        config,
        Stores::from_shared(store.clone()),
        Arc::new(MemoryBackend::new()),
        notifier.clone(),
    )
    .expect("app state");
    TestApp {
        router: tally_api::router(state.clone()),
        state,
        store,
        notifier,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: Value,
}

impl TestResponse {
    /// Value of a cookie set by this response.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| {
                v.split(';')
                    .next()
                    .and_then(|pair| pair.strip_prefix(&format!("{name}=")))
                    .map(str::to_string)
            })
    }
}

pub async fn send(app: &TestApp, request: Request<Body>) -> TestResponse {
    let response = app.router.clone().oneshot(request).await.expect("request");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("parse JSON")
    };
    TestResponse {
        status,
        headers,
        json,
    }
}

pub fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn post(app: &TestApp, uri: &str, body: Value) -> TestResponse {
    send(app, json_request(Method::POST, uri, &body)).await
}

/// Tokens held by a signed-in client.
#[derive(Debug, Clone)]
pub struct Session {
    pub access: String,
    pub refresh: String,
    pub csrf: String,
    pub tenant_id: TenantId,
}

impl Session {
    /// A request carrying the bearer token and the CSRF cookie + header.
    pub fn request(&self, method: Method, uri: &str, body: Option<&Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.access))
            .header(
                header::COOKIE,
                format!("tally_csrf={}; tally_refresh={}", self.csrf, self.refresh),
            )
            .header("x-csrf-token", &self.csrf);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request")
    }
}

pub fn refresh_request(refresh_token: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/auth/refresh")
        .header(header::COOKIE, format!("tally_refresh={refresh_token}"))
        .body(Body::empty())
        .expect("request")
}

/// Register `email` and consume its verification token. Returns the new tenant.
pub async fn register_verified(app: &TestApp, email: &str) -> TenantId {
    let resp = post(
        app,
        "/auth/register",
        json!({"email": email, "password": PASSWORD}),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{}", resp.json);
    let tenant_id = serde_json::from_value(resp.json["tenant"]["id"].clone()).expect("tenant id");

    let token = app
        .notifier
        .latest_token(email, OneTimePurpose::EmailVerification)
        .await
        .expect("verification token sent");
    let resp = post(app, "/auth/verify-email", json!({"token": token})).await;
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.json);
    tenant_id
}

pub fn session_from(resp: &TestResponse) -> Session {
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.json);
    Session {
        access: resp.json["accessToken"]
            .as_str()
            .expect("access token")
            .to_string(),
        refresh: resp.cookie("tally_refresh").expect("refresh cookie"),
        csrf: resp.cookie("tally_csrf").expect("csrf cookie"),
        tenant_id: serde_json::from_value(resp.json["tenant"]["id"].clone()).expect("tenant id"),
    }
}

pub async fn login(app: &TestApp, email: &str, password: &str) -> TestResponse {
    post(
        app,
        "/auth/login",
        json!({"email": email, "password": password}),
    )
    .await
}

pub async fn sign_in(app: &TestApp, email: &str) -> Session {
    session_from(&login(app, email, PASSWORD).await)
}
