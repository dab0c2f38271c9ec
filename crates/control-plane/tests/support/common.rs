#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use axum::Router;
use chrono::Utc;
use control_plane::app_state::AppState;
use control_plane::persistence::{self as db, agents::NewAgent};
use control_plane::routes::build_router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_ADMIN_SECRET: &str = "dev-admin-secret";
pub const TEST_AGENT_TOKEN: &str = "dev-agent-token";

// The shared wire crate is also named `common`; these helpers keep the test
// module usable under the same name.
pub fn api_kind_compute() -> ::common::api::ResourceKind {
    ::common::api::ResourceKind::ComputeNode
}

pub fn api_kind_service_node() -> ::common::api::ResourceKind {
    ::common::api::ResourceKind::ServiceNode
}

pub async fn setup_app() -> (Router, AppState) {
    let cfg = control_plane::config::load(None).expect("config");
    let pool = db::migrations::init_pool("sqlite::memory:", 1)
        .await
        .expect("db init");
    db::migrations::run_migrations(&pool).await.expect("migrations");
    control_plane::bootstrap_admin(&pool, &cfg)
        .await
        .expect("bootstrap admin");

    let state = control_plane::make_app_state(&cfg, pool);
    let app = build_router(state.clone()).with_state(state.clone());
    (app, state)
}

pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = HttpRequest::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Authenticate the bootstrap admin and return a bearer token.
pub async fn admin_token(app: &Router) -> String {
    let (status, body) = request(
        app,
        "POST",
        "/v1/iam/auth",
        None,
        Some(json!({"name": "admin", "secret": TEST_ADMIN_SECRET})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "admin auth failed: {body}");
    body["token"].as_str().expect("token").to_string()
}

/// Create a user through the API and return (uuid, bearer token).
pub async fn create_user_with_token(app: &Router, name: &str) -> (Uuid, String) {
    let admin = admin_token(app).await;
    let (status, body) = request(
        app,
        "POST",
        "/v1/iam/users/",
        Some(&admin),
        Some(json!({"name": name, "secret": "user-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "user create failed: {body}");
    let uuid: Uuid = serde_json::from_value(body["uuid"].clone()).expect("uuid");

    let (status, body) = request(
        app,
        "POST",
        "/v1/iam/auth",
        None,
        Some(json!({"name": name, "secret": "user-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (uuid, body["token"].as_str().expect("token").to_string())
}

/// Register a live agent directly in the store.
pub async fn register_live_agent(state: &AppState, capabilities: &[&str]) -> Uuid {
    let uuid = Uuid::new_v4();
    register_live_agent_with_uuid(state, uuid, capabilities).await;
    uuid
}

pub async fn register_live_agent_with_uuid(state: &AppState, uuid: Uuid, capabilities: &[&str]) {
    db::agents::upsert_agent(
        &state.db,
        NewAgent {
            uuid,
            name: format!("agent-{uuid}"),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        },
    )
    .await
    .expect("agent upsert");
    db::agents::touch_heartbeat(&state.db, uuid, Utc::now())
        .await
        .expect("heartbeat");
}

/// Push an agent status report through the status endpoint, the way the
/// universal agent does after a diff pass.
pub async fn push_actual(
    app: &Router,
    agent: Uuid,
    kind: &str,
    actuals: Value,
) -> StatusCode {
    let (status, body) = request(
        app,
        "POST",
        "/v1/status/actuals",
        Some(TEST_AGENT_TOKEN),
        Some(json!({
            "agent_uuid": agent,
            "kind": kind,
            "actuals": actuals,
        })),
    )
    .await;
    assert!(
        status == StatusCode::OK,
        "status push failed: {status} {body}"
    );
    status
}
