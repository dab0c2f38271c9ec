use std::collections::HashSet;
use std::net::Ipv4Addr;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use common::api::{
    CertificateSpec, InterfaceSpec, LoadBalancerSpec, MachinePoolSpec, NetworkSpec, NodeSetSpec,
    NodeSpec, PasswordSpec, ResourceKind, RouteCondition, RouteSpec, SubnetSpec, VhostSpec,
    SERVICE_PROJECT_ID,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::http::{check_permission_tx, require_user};
use crate::ipam::Cidr;
use crate::persistence::{self, NewTarget, TargetRecord};
use crate::reconciler::fanout;

pub fn router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/nodes/", get(list_nodes).post(create_node))
        .route(
            "/v1/nodes/{uuid}",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route("/v1/em/services/", get(list_services).post(create_service))
        .route(
            "/v1/em/services/{uuid}",
            get(get_service).put(update_service).delete(delete_service),
        )
        .route(
            "/v1/secret/passwords/",
            get(list_passwords).post(create_password),
        )
        .route(
            "/v1/secret/passwords/{uuid}",
            get(get_password).put(update_password).delete(delete_password),
        )
        .route(
            "/v1/secret/certificates/",
            get(list_certificates).post(create_certificate),
        )
        .route(
            "/v1/secret/certificates/{uuid}",
            get(get_certificate)
                .put(update_certificate)
                .delete(delete_certificate),
        )
        .route("/v1/network/lb/", get(list_lbs).post(create_lb))
        .route("/v1/network/lb/{uuid}", get(get_lb).delete(delete_lb))
        .route("/v1/network/lb/{lb}/vhosts/", get(list_vhosts).post(create_vhost))
        .route(
            "/v1/network/lb/{lb}/vhosts/{uuid}",
            get(get_vhost).delete(delete_vhost),
        )
        .route(
            "/v1/network/lb/{lb}/vhosts/{vhost}/routes/",
            get(list_routes).post(create_route),
        )
        .route(
            "/v1/network/lb/{lb}/vhosts/{vhost}/routes/{uuid}",
            get(get_route).delete(delete_route),
        )
        .route(
            "/v1/network/lb/{lb}/backend_pools/",
            get(list_pools).post(create_pool),
        )
        .route(
            "/v1/network/lb/{lb}/backend_pools/{uuid}",
            get(get_pool).delete(delete_pool),
        )
        .route("/v1/pools/", get(list_machine_pools).post(create_machine_pool))
        .route(
            "/v1/pools/{uuid}",
            get(get_machine_pool)
                .put(update_machine_pool)
                .delete(delete_machine_pool),
        )
        .route("/v1/sets/", get(list_sets).post(create_set))
        .route(
            "/v1/sets/{uuid}",
            get(get_set).put(update_set).delete(delete_set),
        )
        .route("/v1/networks/", get(list_networks).post(create_network))
        .route(
            "/v1/networks/{uuid}",
            get(get_network).put(update_network).delete(delete_network),
        )
        .route("/v1/subnets/", get(list_subnets).post(create_subnet))
        .route(
            "/v1/subnets/{uuid}",
            get(get_subnet).put(update_subnet).delete(delete_subnet),
        )
        .route("/v1/interfaces/", get(list_interfaces).post(create_interface))
        .route(
            "/v1/interfaces/{uuid}",
            get(get_interface).delete(delete_interface),
        )
}

/// Pull the project scope out of a flat request body; the remainder is the
/// kind-specific spec.
fn split_project(mut body: Value) -> ApiResult<(Uuid, Value)> {
    let Some(map) = body.as_object_mut() else {
        return Err(AppError::validation("request body must be a JSON object"));
    };
    let project_id = match map.remove("project_id") {
        Some(value) => serde_json::from_value(value)
            .map_err(|_| AppError::validation("project_id must be a uuid"))?,
        None => SERVICE_PROJECT_ID,
    };
    Ok((project_id, body))
}

/// Parse-validate a spec payload against its kind's typed schema and return
/// the normalized form that gets stored.
fn validate_spec(kind: ResourceKind, spec: &Value) -> ApiResult<Value> {
    let normalized = match kind {
        ResourceKind::ComputeNode => to_normalized::<NodeSpec>(spec)?,
        ResourceKind::Password => to_normalized::<PasswordSpec>(spec)?,
        ResourceKind::Certificate => to_normalized::<CertificateSpec>(spec)?,
        ResourceKind::LoadBalancer => to_normalized::<LoadBalancerSpec>(spec)?,
        ResourceKind::Vhost => to_normalized::<VhostSpec>(spec)?,
        ResourceKind::Route => to_normalized::<RouteSpec>(spec)?,
        ResourceKind::BackendPool => to_normalized::<common::api::BackendPoolSpec>(spec)?,
        ResourceKind::MachinePool => to_normalized::<MachinePoolSpec>(spec)?,
        ResourceKind::NodeSet => to_normalized::<NodeSetSpec>(spec)?,
        ResourceKind::Network => to_normalized::<NetworkSpec>(spec)?,
        ResourceKind::Subnet => {
            let subnet: SubnetSpec = serde_json::from_value(spec.clone())
                .map_err(|err| AppError::validation(format!("invalid subnet spec: {err}")))?;
            Cidr::parse(&subnet.cidr).map_err(AppError::validation)?;
            serde_json::to_value(subnet).map_err(anyhow::Error::from)?
        }
        ResourceKind::Interface => to_normalized::<InterfaceSpec>(spec)?,
        ResourceKind::Service => {
            let service = fanout::parse_service_spec(spec).map_err(AppError::validation)?;
            serde_json::to_value(service).map_err(anyhow::Error::from)?
        }
        ResourceKind::ServiceNode => {
            return Err(AppError::validation(
                "service nodes are created by the orchestrator",
            ))
        }
    };
    Ok(normalized)
}

/// Reference integrity at write time: every declared reference must point at
/// an extant entity of the declared kind.
async fn validate_references(state: &AppState, kind: ResourceKind, spec: &Value) -> ApiResult<()> {
    match kind {
        ResourceKind::ComputeNode => {
            let node: NodeSpec = serde_json::from_value(spec.clone()).map_err(anyhow::Error::from)?;
            if let Some(pool_id) = node.pool_id {
                require_existing(state, ResourceKind::MachinePool, pool_id, "pool_id").await?;
            }
            for interface in &node.interfaces {
                require_existing(state, ResourceKind::Interface, *interface, "interfaces").await?;
            }
        }
        ResourceKind::NodeSet => {
            let set: NodeSetSpec = serde_json::from_value(spec.clone()).map_err(anyhow::Error::from)?;
            for node in &set.nodes {
                require_existing(state, ResourceKind::ComputeNode, *node, "nodes").await?;
            }
        }
        ResourceKind::Route => {
            let route: RouteSpec = serde_json::from_value(spec.clone()).map_err(anyhow::Error::from)?;
            require_existing(state, ResourceKind::BackendPool, route.pool_id, "pool_id").await?;
        }
        _ => {}
    }
    Ok(())
}

async fn require_existing(
    state: &AppState,
    kind: ResourceKind,
    uuid: Uuid,
    field: &str,
) -> ApiResult<()> {
    let exists = persistence::resources::get_target(&state.db, uuid)
        .await?
        .map(|record| record.kind == kind.as_str())
        .unwrap_or(false);
    if exists {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "{field} references a missing {}",
            kind.as_str()
        )))
    }
}

/// Field-level immutability enforced on updates.
fn validate_update(kind: ResourceKind, old: &Value, new: &Value) -> ApiResult<()> {
    match kind {
        ResourceKind::Subnet => {
            if old.get("cidr") != new.get("cidr") {
                return Err(AppError::validation("a subnet's cidr is immutable"));
            }
        }
        ResourceKind::MachinePool => {
            if old.get("driver") != new.get("driver") {
                return Err(AppError::validation(
                    "a machine pool's driver kind is immutable",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Containment and ownership guards before a target is marked DELETING.
async fn validate_delete(state: &AppState, kind: ResourceKind, uuid: Uuid) -> ApiResult<()> {
    if kind != ResourceKind::MachinePool {
        return Ok(());
    }

    let nodes =
        persistence::resources::list_targets(&state.db, None, Some(ResourceKind::ComputeNode))
            .await?;
    let referenced = nodes.iter().any(|node| {
        node.spec
            .0
            .get("pool_id")
            .and_then(|value| value.as_str())
            .map(|value| value == uuid.to_string())
            .unwrap_or(false)
    });
    if referenced {
        return Err(AppError::conflict(
            "machine pool still owns nodes; delete them first",
        ));
    }
    Ok(())
}

fn to_normalized<T: serde::de::DeserializeOwned + serde::Serialize>(
    spec: &Value,
) -> ApiResult<Value> {
    let typed: T = serde_json::from_value(spec.clone())
        .map_err(|err| AppError::validation(format!("invalid spec: {err}")))?;
    Ok(serde_json::to_value(typed).map_err(anyhow::Error::from)?)
}

/// IAM check and target insert in one transaction.
async fn authorize_and_insert(
    state: &AppState,
    subject: Uuid,
    kind: ResourceKind,
    permission: &str,
    project_id: Uuid,
    spec: Value,
    parent_id: Option<Uuid>,
) -> ApiResult<TargetRecord> {
    let mut tx = state.db.begin().await.map_err(anyhow::Error::from)?;
    check_permission_tx(&mut tx, subject, project_id, permission).await?;
    let mut new_target = NewTarget::new(kind, project_id, spec);
    new_target.parent_id = parent_id;
    let record = persistence::resources::create_target_tx(&mut tx, new_target).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(record)
}

async fn create_common(
    state: &AppState,
    headers: &HeaderMap,
    kind: ResourceKind,
    permission_prefix: &str,
    body: Value,
    parent_id: Option<Uuid>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let subject = require_user(state, headers).await?;
    let (project_id, spec) = split_project(body)?;
    let spec = validate_spec(kind, &spec)?;
    validate_references(state, kind, &spec).await?;
    let record = authorize_and_insert(
        state,
        subject.uuid,
        kind,
        &format!("{permission_prefix}.create"),
        project_id,
        spec,
        parent_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!(record.envelope()?))))
}

async fn list_common(
    state: &AppState,
    headers: &HeaderMap,
    kind: ResourceKind,
    permission_prefix: &str,
) -> ApiResult<Json<Value>> {
    let subject = require_user(state, headers).await?;
    state
        .authz
        .check(
            subject.uuid,
            SERVICE_PROJECT_ID,
            &format!("{permission_prefix}.list"),
        )
        .await?;

    let records = persistence::resources::list_targets(&state.db, None, Some(kind)).await?;
    let envelopes: Vec<_> = records
        .iter()
        .map(|record| record.envelope())
        .collect::<crate::Result<_>>()?;
    Ok(Json(json!(envelopes)))
}

async fn get_common(
    state: &AppState,
    headers: &HeaderMap,
    kind: ResourceKind,
    permission_prefix: &str,
    uuid: Uuid,
) -> ApiResult<Json<Value>> {
    let subject = require_user(state, headers).await?;
    let record = fetch_kind(state, kind, uuid).await?;
    state
        .authz
        .check(
            subject.uuid,
            record.project_id,
            &format!("{permission_prefix}.read"),
        )
        .await?;

    let actual = persistence::resources::get_actual(&state.db, uuid).await?;
    let actual_envelope = match actual {
        Some(actual) => Some(json!({
            "uuid": actual.uuid,
            "kind": actual.kind,
            "project_id": actual.project_id,
            "version": actual.version,
            "status": actual.status,
            "spec": actual.spec.0,
            "observed_at": actual.observed_at,
        })),
        None => None,
    };

    Ok(Json(json!({
        "target": record.envelope()?,
        "actual": actual_envelope,
    })))
}

async fn update_common(
    state: &AppState,
    headers: &HeaderMap,
    kind: ResourceKind,
    permission_prefix: &str,
    uuid: Uuid,
    body: Value,
) -> ApiResult<Json<Value>> {
    let subject = require_user(state, headers).await?;
    let record = fetch_kind(state, kind, uuid).await?;
    state
        .authz
        .check(
            subject.uuid,
            record.project_id,
            &format!("{permission_prefix}.update"),
        )
        .await?;

    let Some(version) = body.get("version").and_then(|value| value.as_i64()) else {
        return Err(AppError::validation("update requires the observed version"));
    };
    let mut spec = body;
    if let Some(map) = spec.as_object_mut() {
        map.remove("version");
        map.remove("project_id");
    }
    let spec = validate_spec(kind, &spec)?;
    validate_update(kind, &record.spec.0, &spec)?;
    validate_references(state, kind, &spec).await?;

    let updated = persistence::resources::cas_update_spec(&state.db, uuid, version, &spec).await?;
    if updated == 0 {
        return Err(AppError::conflict("version is stale"));
    }

    let record = fetch_kind(state, kind, uuid).await?;
    Ok(Json(json!(record.envelope()?)))
}

async fn delete_common(
    state: &AppState,
    headers: &HeaderMap,
    kind: ResourceKind,
    permission_prefix: &str,
    uuid: Uuid,
) -> ApiResult<StatusCode> {
    let subject = require_user(state, headers).await?;
    let record = fetch_kind(state, kind, uuid).await?;
    state
        .authz
        .check(
            subject.uuid,
            record.project_id,
            &format!("{permission_prefix}.delete"),
        )
        .await?;
    validate_delete(state, kind, uuid).await?;

    persistence::resources::mark_deleting(&state.db, uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_kind(state: &AppState, kind: ResourceKind, uuid: Uuid) -> ApiResult<TargetRecord> {
    let record = persistence::resources::get_target(&state.db, uuid)
        .await?
        .ok_or_else(|| AppError::not_found("resource not found"))?;
    if record.kind != kind.as_str() {
        return Err(AppError::not_found("resource not found"));
    }
    Ok(record)
}

macro_rules! crud_handlers {
    ($kind:expr, $prefix:literal, $create:ident, $list:ident, $get:ident, $update:ident, $delete:ident) => {
        async fn $create(
            State(state): State<AppState>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> ApiResult<(StatusCode, Json<Value>)> {
            create_common(&state, &headers, $kind, $prefix, body, None).await
        }

        async fn $list(
            State(state): State<AppState>,
            headers: HeaderMap,
        ) -> ApiResult<Json<Value>> {
            list_common(&state, &headers, $kind, $prefix).await
        }

        async fn $get(
            State(state): State<AppState>,
            headers: HeaderMap,
            Path(uuid): Path<Uuid>,
        ) -> ApiResult<Json<Value>> {
            get_common(&state, &headers, $kind, $prefix, uuid).await
        }

        async fn $update(
            State(state): State<AppState>,
            headers: HeaderMap,
            Path(uuid): Path<Uuid>,
            Json(body): Json<Value>,
        ) -> ApiResult<Json<Value>> {
            update_common(&state, &headers, $kind, $prefix, uuid, body).await
        }

        async fn $delete(
            State(state): State<AppState>,
            headers: HeaderMap,
            Path(uuid): Path<Uuid>,
        ) -> ApiResult<StatusCode> {
            delete_common(&state, &headers, $kind, $prefix, uuid).await
        }
    };
}

crud_handlers!(
    ResourceKind::ComputeNode,
    "compute.nodes",
    create_node,
    list_nodes,
    get_node,
    update_node,
    delete_node
);
crud_handlers!(
    ResourceKind::Service,
    "em.services",
    create_service,
    list_services,
    get_service,
    update_service,
    delete_service
);
crud_handlers!(
    ResourceKind::Password,
    "secret.passwords",
    create_password,
    list_passwords,
    get_password,
    update_password,
    delete_password
);
crud_handlers!(
    ResourceKind::Certificate,
    "secret.certificates",
    create_certificate,
    list_certificates,
    get_certificate,
    update_certificate,
    delete_certificate
);

// The load balancer tree is containment-shaped: children carry their parent
// id and are created under the parent's path.

async fn create_lb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    create_common(
        &state,
        &headers,
        ResourceKind::LoadBalancer,
        "network.load_balancers",
        body,
        None,
    )
    .await
}

async fn list_lbs(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    list_common(&state, &headers, ResourceKind::LoadBalancer, "network.load_balancers").await
}

async fn get_lb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::LoadBalancer, "network.load_balancers", uuid).await
}

async fn delete_lb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::LoadBalancer, "network.load_balancers", uuid).await
}

async fn create_vhost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lb): Path<Uuid>,
    Json(mut body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_user(&state, &headers).await?;
    fetch_kind(&state, ResourceKind::LoadBalancer, lb).await?;
    if let Some(map) = body.as_object_mut() {
        map.insert("lb_id".into(), json!(lb));
    }

    let vhost: VhostSpec = serde_json::from_value(body.clone())
        .map_err(|err| AppError::validation(format!("invalid vhost spec: {err}")))?;

    // (protocol, port) must be unique inside one load balancer.
    let siblings = persistence::resources::children_of(&state.db, lb).await?;
    for sibling in siblings {
        if sibling.kind != ResourceKind::Vhost.as_str() {
            continue;
        }
        if let Ok(existing) = serde_json::from_value::<VhostSpec>(sibling.spec.0.clone()) {
            if existing.protocol == vhost.protocol && existing.port == vhost.port {
                return Err(AppError::conflict(
                    "a vhost with this protocol and port already exists on the load balancer",
                ));
            }
        }
    }

    create_common(&state, &headers, ResourceKind::Vhost, "network.vhosts", body, Some(lb)).await
}

async fn list_vhosts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lb): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_user(&state, &headers).await?;
    fetch_kind(&state, ResourceKind::LoadBalancer, lb).await?;
    list_common(&state, &headers, ResourceKind::Vhost, "network.vhosts").await
}

async fn get_vhost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, uuid)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::Vhost, "network.vhosts", uuid).await
}

async fn delete_vhost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, uuid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::Vhost, "network.vhosts", uuid).await
}

async fn create_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, vhost)): Path<(Uuid, Uuid)>,
    Json(mut body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_user(&state, &headers).await?;
    let vhost_record = fetch_kind(&state, ResourceKind::Vhost, vhost).await?;
    if let Some(map) = body.as_object_mut() {
        map.insert("vhost_id".into(), json!(vhost));
    }

    let route: RouteSpec = serde_json::from_value(body.clone())
        .map_err(|err| AppError::validation(format!("invalid route spec: {err}")))?;

    if matches!(route.condition, RouteCondition::Raw { .. }) {
        let vhost_spec: VhostSpec = serde_json::from_value(vhost_record.spec.0.clone())
            .map_err(anyhow::Error::from)?;
        if !vhost_spec.protocol.is_stream() {
            return Err(AppError::validation(
                "raw route conditions are only legal on tcp/udp vhosts",
            ));
        }
    }

    create_common(&state, &headers, ResourceKind::Route, "network.routes", body, Some(vhost)).await
}

async fn list_routes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, vhost)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    require_user(&state, &headers).await?;
    fetch_kind(&state, ResourceKind::Vhost, vhost).await?;
    list_common(&state, &headers, ResourceKind::Route, "network.routes").await
}

async fn get_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, _vhost, uuid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::Route, "network.routes", uuid).await
}

async fn delete_route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, _vhost, uuid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::Route, "network.routes", uuid).await
}

async fn create_pool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lb): Path<Uuid>,
    Json(mut body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_user(&state, &headers).await?;
    fetch_kind(&state, ResourceKind::LoadBalancer, lb).await?;
    if let Some(map) = body.as_object_mut() {
        map.insert("lb_id".into(), json!(lb));
    }
    create_common(
        &state,
        &headers,
        ResourceKind::BackendPool,
        "network.backend_pools",
        body,
        Some(lb),
    )
    .await
}

async fn list_pools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lb): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    require_user(&state, &headers).await?;
    fetch_kind(&state, ResourceKind::LoadBalancer, lb).await?;
    list_common(&state, &headers, ResourceKind::BackendPool, "network.backend_pools").await
}

async fn get_pool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, uuid)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::BackendPool, "network.backend_pools", uuid).await
}

async fn delete_pool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_lb, uuid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::BackendPool, "network.backend_pools", uuid).await
}

crud_handlers!(
    ResourceKind::MachinePool,
    "compute.pools",
    create_machine_pool,
    list_machine_pools,
    get_machine_pool,
    update_machine_pool,
    delete_machine_pool
);
crud_handlers!(
    ResourceKind::NodeSet,
    "compute.sets",
    create_set,
    list_sets,
    get_set,
    update_set,
    delete_set
);
crud_handlers!(
    ResourceKind::Network,
    "network.networks",
    create_network,
    list_networks,
    get_network,
    update_network,
    delete_network
);

// Subnets hang off their network in the containment tree so deleting a
// network cascades; interfaces hang off their subnet the same way.

async fn create_subnet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_user(&state, &headers).await?;
    let network_id = body
        .get("network_id")
        .and_then(|value| value.as_str())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| AppError::validation("network_id must be a uuid"))?;
    fetch_kind(&state, ResourceKind::Network, network_id)
        .await
        .map_err(|_| AppError::validation("network_id references a missing network"))?;

    create_common(
        &state,
        &headers,
        ResourceKind::Subnet,
        "network.subnets",
        body,
        Some(network_id),
    )
    .await
}

async fn list_subnets(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    list_common(&state, &headers, ResourceKind::Subnet, "network.subnets").await
}

async fn get_subnet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::Subnet, "network.subnets", uuid).await
}

async fn update_subnet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    update_common(&state, &headers, ResourceKind::Subnet, "network.subnets", uuid, body).await
}

async fn delete_subnet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::Subnet, "network.subnets", uuid).await
}

async fn create_interface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_user(&state, &headers).await?;
    let project_id = body.get("project_id").cloned();
    let mut stripped = body;
    if let Some(map) = stripped.as_object_mut() {
        map.remove("project_id");
    }
    let mut spec: InterfaceSpec = serde_json::from_value(stripped)
        .map_err(|err| AppError::validation(format!("invalid interface spec: {err}")))?;

    require_existing(&state, ResourceKind::ComputeNode, spec.node_id, "node_id").await?;
    let subnet_record = fetch_kind(&state, ResourceKind::Subnet, spec.subnet_id)
        .await
        .map_err(|_| AppError::validation("subnet_id references a missing subnet"))?;
    let subnet: SubnetSpec =
        serde_json::from_value(subnet_record.spec.0.clone()).map_err(anyhow::Error::from)?;
    let cidr = Cidr::parse(&subnet.cidr).map_err(AppError::validation)?;

    // IP leases are exclusive per subnet: siblings hold the lease table.
    let siblings = persistence::resources::children_of(&state.db, spec.subnet_id).await?;
    let leased: HashSet<Ipv4Addr> = siblings
        .iter()
        .filter(|sibling| sibling.kind == ResourceKind::Interface.as_str())
        .filter_map(|sibling| sibling.spec.0.get("ip").and_then(|value| value.as_str())?.parse().ok())
        .collect();

    match &spec.ip {
        Some(requested) => {
            let requested: Ipv4Addr = requested
                .parse()
                .map_err(|_| AppError::validation("ip must be an ipv4 address"))?;
            if !cidr.contains(requested) {
                return Err(AppError::validation("ip is outside the subnet cidr"));
            }
            if leased.contains(&requested) {
                return Err(AppError::conflict("ip lease is already held in this subnet"));
            }
        }
        None => {
            let allocated = cidr
                .allocate(&leased)
                .ok_or_else(|| AppError::conflict("subnet has no free addresses"))?;
            spec.ip = Some(allocated.to_string());
        }
    }

    let mut body = serde_json::to_value(&spec).map_err(anyhow::Error::from)?;
    if let (Some(map), Some(project)) = (body.as_object_mut(), project_id) {
        map.insert("project_id".into(), project);
    }

    create_common(
        &state,
        &headers,
        ResourceKind::Interface,
        "network.interfaces",
        body,
        Some(spec.subnet_id),
    )
    .await
}

async fn list_interfaces(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    list_common(&state, &headers, ResourceKind::Interface, "network.interfaces").await
}

async fn get_interface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    get_common(&state, &headers, ResourceKind::Interface, "network.interfaces", uuid).await
}

async fn delete_interface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    delete_common(&state, &headers, ResourceKind::Interface, "network.interfaces", uuid).await
}
