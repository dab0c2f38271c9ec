use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use common::api::{
    EventKind, RegistrationEventPayload, ResetPasswordEventPayload, TokenResponse,
    SERVICE_PROJECT_ID,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::http::{check_permission_tx, hash_token, require_user};
use crate::iam::{validate_permission_name, WILDCARD_PERMISSION};
use crate::persistence::{
    self, NewPermissionBinding, NewRoleBinding, NewUser,
};

pub fn router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/iam/auth", post(authenticate))
        .route("/v1/iam/users/", post(create_user).get(list_users))
        .route(
            "/v1/iam/users/{uuid}/actions/reset_password",
            post(reset_password),
        )
        .route("/v1/iam/permissions/", post(create_permission))
        .route("/v1/iam/roles/", post(create_role))
        .route("/v1/iam/permission_bindings/", post(create_permission_binding))
        .route(
            "/v1/iam/role_bindings/",
            post(create_role_binding).delete(delete_role_binding),
        )
}

#[derive(Debug, Deserialize)]
struct AuthRequest {
    name: String,
    secret: String,
}

async fn authenticate(
    State(state): State<AppState>,
    Json(body): Json<AuthRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = persistence::iam::get_user_by_name(&state.db, &body.name)
        .await?
        .ok_or_else(|| AppError::auth_required("unknown user or bad secret"))?;

    if user.secret_hash != hash_token(&body.secret) {
        return Err(AppError::auth_required("unknown user or bad secret"));
    }

    let token = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::seconds(state.iam.token_ttl_secs as i64);
    persistence::iam::issue_token(&state.db, user.uuid, &hash_token(&token), expires_at).await?;

    Ok(Json(TokenResponse { token, expires_at }))
}

#[derive(Debug, Deserialize)]
struct UserCreate {
    name: String,
    #[serde(default)]
    email: Option<String>,
    secret: String,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserCreate>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let subject = require_user(&state, &headers).await?;
    if body.name.trim().is_empty() {
        return Err(AppError::validation("user name cannot be empty"));
    }

    let new = NewUser {
        uuid: Uuid::new_v4(),
        name: body.name.trim().to_string(),
        email: body.email,
        secret_hash: hash_token(&body.secret),
    };

    // The registration event is committed together with the row; delivery is
    // at-least-once through the outbox.
    let mut tx = state.db.begin().await.map_err(anyhow::Error::from)?;
    check_permission_tx(&mut tx, subject.uuid, SERVICE_PROJECT_ID, "iam.users.create").await?;
    persistence::iam::create_user_tx(&mut tx, &new).await?;
    let payload = serde_json::to_value(RegistrationEventPayload {
        site_endpoint: state.iam.site_endpoint.clone(),
        confirmation_code: Uuid::new_v4(),
    })
    .map_err(anyhow::Error::from)?;
    persistence::outbox::enqueue_tx(&mut tx, EventKind::IamUserRegistration, 1, &payload).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"uuid": new.uuid, "name": new.name})),
    ))
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(subject.uuid, SERVICE_PROJECT_ID, "iam.users.list")
        .await?;

    let users = persistence::iam::list_users(&state.db).await?;
    let body: Vec<_> = users
        .into_iter()
        .map(|user| json!({"uuid": user.uuid, "name": user.name, "email": user.email}))
        .collect();
    Ok(Json(json!(body)))
}

async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let subject = require_user(&state, &headers).await?;
    persistence::iam::get_user(&state.db, uuid)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    let mut tx = state.db.begin().await.map_err(anyhow::Error::from)?;
    check_permission_tx(
        &mut tx,
        subject.uuid,
        SERVICE_PROJECT_ID,
        "iam.users.reset_password",
    )
    .await?;
    let payload = serde_json::to_value(ResetPasswordEventPayload {
        site_endpoint: state.iam.site_endpoint.clone(),
        reset_code: Uuid::new_v4(),
    })
    .map_err(anyhow::Error::from)?;
    persistence::outbox::enqueue_tx(&mut tx, EventKind::IamUserResetPassword, 1, &payload).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct NamedCreate {
    name: String,
}

async fn create_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NamedCreate>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(subject.uuid, SERVICE_PROJECT_ID, "iam.permissions.create")
        .await?;

    if body.name == WILDCARD_PERMISSION {
        return Err(AppError::validation(
            "the wildcard permission is reserved for bootstrap",
        ));
    }
    if !validate_permission_name(&body.name) {
        return Err(AppError::validation(
            "permission names are three dot-separated lowercase segments",
        ));
    }
    if persistence::iam::get_permission_by_name(&state.db, &body.name)
        .await?
        .is_some()
    {
        return Err(AppError::conflict("permission already exists"));
    }

    let record = persistence::iam::create_permission(&state.db, Uuid::new_v4(), &body.name).await?;
    state.authz.invalidate();
    Ok((
        StatusCode::CREATED,
        Json(json!({"uuid": record.uuid, "name": record.name})),
    ))
}

async fn create_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NamedCreate>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(subject.uuid, SERVICE_PROJECT_ID, "iam.roles.create")
        .await?;

    if body.name.trim().is_empty() {
        return Err(AppError::validation("role name cannot be empty"));
    }
    if persistence::iam::get_role_by_name(&state.db, &body.name)
        .await?
        .is_some()
    {
        return Err(AppError::conflict("role already exists"));
    }

    let record = persistence::iam::create_role(&state.db, Uuid::new_v4(), &body.name).await?;
    state.authz.invalidate();
    Ok((
        StatusCode::CREATED,
        Json(json!({"uuid": record.uuid, "name": record.name})),
    ))
}

#[derive(Debug, Deserialize)]
struct PermissionBindingCreate {
    role_id: Uuid,
    permission_id: Uuid,
    #[serde(default)]
    project_id: Option<Uuid>,
}

async fn create_permission_binding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PermissionBindingCreate>,
) -> ApiResult<StatusCode> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(
            subject.uuid,
            SERVICE_PROJECT_ID,
            "iam.permission_bindings.create",
        )
        .await?;

    persistence::iam::create_permission_binding(
        &state.db,
        NewPermissionBinding {
            uuid: Uuid::new_v4(),
            role_id: body.role_id,
            permission_id: body.permission_id,
            project_id: body.project_id,
        },
    )
    .await
    .map_err(|_| AppError::validation("role or permission does not exist"))?;
    state.authz.invalidate();
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct RoleBindingCreate {
    user_id: Uuid,
    role_id: Uuid,
    #[serde(default)]
    project_id: Option<Uuid>,
}

async fn create_role_binding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RoleBindingCreate>,
) -> ApiResult<StatusCode> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(subject.uuid, SERVICE_PROJECT_ID, "iam.role_bindings.create")
        .await?;

    persistence::iam::create_role_binding(
        &state.db,
        NewRoleBinding {
            uuid: Uuid::new_v4(),
            user_id: body.user_id,
            role_id: body.role_id,
            project_id: body.project_id,
        },
    )
    .await
    .map_err(|_| AppError::validation("user or role does not exist"))?;
    state.authz.invalidate();
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct RoleBindingDelete {
    user_id: Uuid,
    role_id: Uuid,
}

async fn delete_role_binding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RoleBindingDelete>,
) -> ApiResult<StatusCode> {
    let subject = require_user(&state, &headers).await?;
    state
        .authz
        .check(subject.uuid, SERVICE_PROJECT_ID, "iam.role_bindings.delete")
        .await?;

    let removed = persistence::iam::delete_role_binding(&state.db, body.user_id, body.role_id).await?;
    state.authz.invalidate();
    if removed == 0 {
        return Err(AppError::not_found("role binding not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}
