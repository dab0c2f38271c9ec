#[path = "support/common.rs"]
mod common;

use axum::http::StatusCode;
use common::{
    admin_token, create_user_with_token, request, setup_app, TEST_AGENT_TOKEN,
};
use control_plane::persistence as db;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn node_create_returns_envelope_in_new_state() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, body) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&admin),
        Some(json!({"name": "n1", "cores": 1, "ram": 1024})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["kind"], "em_core_compute_nodes");
    assert_eq!(body["status"], "NEW");
    assert_eq!(body["version"], 1);
    assert_eq!(body["spec"]["name"], "n1");
}

#[tokio::test]
async fn unauthenticated_requests_get_401() {
    let (app, _state) = setup_app().await;
    let (status, body) = request(&app, "GET", "/v1/nodes/", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "AuthRequiredException");
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn user_without_bindings_is_denied_and_no_row_is_written() {
    let (app, state) = setup_app().await;
    let (_uuid, token) = create_user_with_token(&app, "u").await;

    let (status, body) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&token),
        Some(json!({"name": "n1", "cores": 1, "ram": 1024})),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["type"], "PermissionDeniedException");
    assert_eq!(body["code"], 403);

    let targets = db::resources::list_targets(
        &state.db,
        None,
        Some(common::api_kind_compute()),
    )
    .await
    .expect("list");
    assert!(targets.is_empty(), "denied request must not write a row");
}

#[tokio::test]
async fn concurrent_updates_with_same_version_conflict() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, created) = request(
        &app,
        "POST",
        "/v1/secret/passwords/",
        Some(&admin),
        Some(json!({"name": "db-root"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let uuid = created["uuid"].as_str().unwrap().to_string();
    let version = created["version"].as_i64().unwrap();

    let first = request(
        &app,
        "PUT",
        &format!("/v1/secret/passwords/{uuid}"),
        Some(&admin),
        Some(json!({"version": version, "name": "db-root", "length": 32})),
    )
    .await;
    assert_eq!(first.0, StatusCode::OK, "{}", first.1);

    let second = request(
        &app,
        "PUT",
        &format!("/v1/secret/passwords/{uuid}"),
        Some(&admin),
        Some(json!({"version": version, "name": "db-root", "length": 48})),
    )
    .await;
    assert_eq!(second.0, StatusCode::CONFLICT);
    assert_eq!(second.1["type"], "ConflictException");
}

#[tokio::test]
async fn service_hooks_of_kind_service_are_rejected() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, body) = request(
        &app,
        "POST",
        "/v1/em/services/",
        Some(&admin),
        Some(json!({
            "name": "web",
            "service_type": "simple",
            "target": {"kind": "node", "node": Uuid::new_v4()},
            "command": "/usr/bin/web",
            "before": [{"kind": "service", "ref": Uuid::new_v4()}],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "ValidationException");
    assert!(body["message"].as_str().unwrap().contains("not supported yet"));
}

#[tokio::test]
async fn vhost_protocol_port_pairs_are_unique_per_lb() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, lb) = request(
        &app,
        "POST",
        "/v1/network/lb/",
        Some(&admin),
        Some(json!({"name": "lb1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let lb_uuid = lb["uuid"].as_str().unwrap().to_string();

    let first = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/"),
        Some(&admin),
        Some(json!({"protocol": "https", "port": 443})),
    )
    .await;
    assert_eq!(first.0, StatusCode::CREATED, "{}", first.1);

    let duplicate = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/"),
        Some(&admin),
        Some(json!({"protocol": "https", "port": 443})),
    )
    .await;
    assert_eq!(duplicate.0, StatusCode::CONFLICT);

    let other_port = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/"),
        Some(&admin),
        Some(json!({"protocol": "https", "port": 8443})),
    )
    .await;
    assert_eq!(other_port.0, StatusCode::CREATED);
}

#[tokio::test]
async fn raw_route_conditions_require_stream_protocols() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (_, lb) = request(
        &app,
        "POST",
        "/v1/network/lb/",
        Some(&admin),
        Some(json!({"name": "lb1"})),
    )
    .await;
    let lb_uuid = lb["uuid"].as_str().unwrap().to_string();

    let (_, pool) = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/backend_pools/"),
        Some(&admin),
        Some(json!({"name": "pool1", "members": ["10.0.0.1:80"]})),
    )
    .await;
    let pool_uuid = pool["uuid"].as_str().unwrap().to_string();

    let (_, https_vhost) = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/"),
        Some(&admin),
        Some(json!({"protocol": "https", "port": 443})),
    )
    .await;
    let https_uuid = https_vhost["uuid"].as_str().unwrap().to_string();

    let rejected = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/{https_uuid}/routes/"),
        Some(&admin),
        Some(json!({
            "condition": {"kind": "raw", "value": "sni=example"},
            "pool_id": pool_uuid,
        })),
    )
    .await;
    assert_eq!(rejected.0, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.1["type"], "ValidationException");

    let (_, tcp_vhost) = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/"),
        Some(&admin),
        Some(json!({"protocol": "tcp", "port": 5432})),
    )
    .await;
    let tcp_uuid = tcp_vhost["uuid"].as_str().unwrap().to_string();

    let accepted = request(
        &app,
        "POST",
        &format!("/v1/network/lb/{lb_uuid}/vhosts/{tcp_uuid}/routes/"),
        Some(&admin),
        Some(json!({
            "condition": {"kind": "raw", "value": "sni=example"},
            "pool_id": pool_uuid,
        })),
    )
    .await;
    assert_eq!(accepted.0, StatusCode::CREATED, "{}", accepted.1);
}

#[tokio::test]
async fn granted_binding_chain_allows_creation_and_revocation_denies() {
    let (app, state) = setup_app().await;
    let admin = admin_token(&app).await;
    let (user_uuid, user_token) = create_user_with_token(&app, "operator").await;

    let (status, permission) = request(
        &app,
        "POST",
        "/v1/iam/permissions/",
        Some(&admin),
        Some(json!({"name": "compute.nodes.create"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{permission}");

    let (status, role) = request(
        &app,
        "POST",
        "/v1/iam/roles/",
        Some(&admin),
        Some(json!({"name": "node-operators"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{role}");

    let (status, _) = request(
        &app,
        "POST",
        "/v1/iam/permission_bindings/",
        Some(&admin),
        Some(json!({
            "role_id": role["uuid"],
            "permission_id": permission["uuid"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = request(
        &app,
        "POST",
        "/v1/iam/role_bindings/",
        Some(&admin),
        Some(json!({"user_id": user_uuid, "role_id": role["uuid"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&user_token),
        Some(json!({"name": "n1", "cores": 1, "ram": 1024})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    // Revoke the role; the next identical request must be denied.
    let (status, _) = request(
        &app,
        "DELETE",
        "/v1/iam/role_bindings/",
        Some(&admin),
        Some(json!({"user_id": user_uuid, "role_id": role["uuid"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&user_token),
        Some(json!({"name": "n2", "cores": 1, "ram": 1024})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

    let targets = db::resources::list_targets(&state.db, None, Some(common::api_kind_compute()))
        .await
        .expect("list");
    assert_eq!(targets.len(), 1, "only the granted create may land");
}

#[tokio::test]
async fn permission_grammar_is_enforced_at_creation() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    for bad in ["em.services", "Em.services.create", "*.*.*", "a.b.c.d"] {
        let (status, _) = request(
            &app,
            "POST",
            "/v1/iam/permissions/",
            Some(&admin),
            Some(json!({"name": bad})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad} must be rejected");
    }
}

#[tokio::test]
async fn user_registration_commits_an_outbox_event() {
    let (app, state) = setup_app().await;
    create_user_with_token(&app, "newcomer").await;

    let due = db::outbox::due_events(&state.db, chrono::Utc::now(), 10)
        .await
        .expect("due");
    assert!(
        due.iter().any(|event| event.kind == "IamUserRegistration"),
        "registration event must be queued with the user row"
    );
}

#[tokio::test]
async fn agent_endpoints_require_the_static_credential() {
    let (app, _state) = setup_app().await;

    let (status, _) = request(
        &app,
        "POST",
        "/v1/orch/agents/register",
        Some("wrong-token"),
        Some(json!({
            "uuid": Uuid::new_v4(),
            "name": "a1",
            "capabilities": ["password"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let agent_uuid = Uuid::new_v4();
    let (status, body) = request(
        &app,
        "POST",
        "/v1/orch/agents/register",
        Some(TEST_AGENT_TOKEN),
        Some(json!({
            "uuid": agent_uuid,
            "name": "a1",
            "capabilities": ["password", "em_core_*"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["uuid"].as_str().unwrap(), agent_uuid.to_string());
}

#[tokio::test]
async fn subnet_cidr_is_immutable_and_validated() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (_, network) = request(
        &app,
        "POST",
        "/v1/networks/",
        Some(&admin),
        Some(json!({"name": "net1", "driver": "flat"})),
    )
    .await;
    let network_uuid = network["uuid"].as_str().unwrap().to_string();

    let (status, _) = request(
        &app,
        "POST",
        "/v1/subnets/",
        Some(&admin),
        Some(json!({"network_id": network_uuid, "cidr": "10.0.0.5/24"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "host addresses are not cidrs");

    let (status, subnet) = request(
        &app,
        "POST",
        "/v1/subnets/",
        Some(&admin),
        Some(json!({"network_id": network_uuid, "cidr": "10.0.0.0/24"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{subnet}");
    let subnet_uuid = subnet["uuid"].as_str().unwrap().to_string();
    let version = subnet["version"].as_i64().unwrap();

    let (status, body) = request(
        &app,
        "PUT",
        &format!("/v1/subnets/{subnet_uuid}"),
        Some(&admin),
        Some(json!({
            "version": version,
            "network_id": network_uuid,
            "cidr": "10.9.0.0/24",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert!(body["message"].as_str().unwrap().contains("immutable"));
}

#[tokio::test]
async fn interface_ip_leases_are_exclusive_per_subnet() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (_, node) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&admin),
        Some(json!({"name": "n1", "cores": 1, "ram": 1024})),
    )
    .await;
    let node_uuid = node["uuid"].as_str().unwrap().to_string();

    let (_, network) = request(
        &app,
        "POST",
        "/v1/networks/",
        Some(&admin),
        Some(json!({"name": "net1", "driver": "flat"})),
    )
    .await;
    let network_uuid = network["uuid"].as_str().unwrap().to_string();

    let (_, subnet) = request(
        &app,
        "POST",
        "/v1/subnets/",
        Some(&admin),
        Some(json!({"network_id": network_uuid, "cidr": "10.0.0.0/29"})),
    )
    .await;
    let subnet_uuid = subnet["uuid"].as_str().unwrap().to_string();

    // First interface takes the lowest free host address.
    let (status, first) = request(
        &app,
        "POST",
        "/v1/interfaces/",
        Some(&admin),
        Some(json!({"node_id": node_uuid, "subnet_id": subnet_uuid})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["spec"]["ip"], "10.0.0.1");

    // An explicit duplicate lease conflicts.
    let (status, body) = request(
        &app,
        "POST",
        "/v1/interfaces/",
        Some(&admin),
        Some(json!({
            "node_id": node_uuid,
            "subnet_id": subnet_uuid,
            "ip": "10.0.0.1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    // Out-of-range addresses are rejected outright.
    let (status, _) = request(
        &app,
        "POST",
        "/v1/interfaces/",
        Some(&admin),
        Some(json!({
            "node_id": node_uuid,
            "subnet_id": subnet_uuid,
            "ip": "10.1.0.1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Allocation continues past the held lease.
    let (status, second) = request(
        &app,
        "POST",
        "/v1/interfaces/",
        Some(&admin),
        Some(json!({"node_id": node_uuid, "subnet_id": subnet_uuid})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["spec"]["ip"], "10.0.0.2");
}

#[tokio::test]
async fn machine_pool_driver_is_immutable_and_owned_nodes_block_deletion() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, pool) = request(
        &app,
        "POST",
        "/v1/pools/",
        Some(&admin),
        Some(json!({"name": "default", "driver": "dummy"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{pool}");
    let pool_uuid = pool["uuid"].as_str().unwrap().to_string();
    let version = pool["version"].as_i64().unwrap();

    let (status, body) = request(
        &app,
        "PUT",
        &format!("/v1/pools/{pool_uuid}"),
        Some(&admin),
        Some(json!({"version": version, "name": "default", "driver": "libvirt"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&admin),
        Some(json!({"name": "n1", "cores": 1, "ram": 1024, "pool_id": pool_uuid})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(
        &app,
        "DELETE",
        &format!("/v1/pools/{pool_uuid}"),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

#[tokio::test]
async fn node_references_must_exist() {
    let (app, _state) = setup_app().await;
    let admin = admin_token(&app).await;

    let (status, body) = request(
        &app,
        "POST",
        "/v1/nodes/",
        Some(&admin),
        Some(json!({
            "name": "n1",
            "cores": 1,
            "ram": 1024,
            "pool_id": Uuid::new_v4(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["type"], "ValidationException");
}
