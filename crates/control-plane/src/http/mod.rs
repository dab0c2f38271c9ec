use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::iam::permission_matches;
use crate::persistence::{self, UserRecord};
use crate::telemetry;

pub(crate) use crate::iam::hash_secret as hash_token;

mod iam;
mod orch;
mod resources;
mod system;

pub fn build_router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .merge(system::router())
        .merge(iam::router(state.clone()))
        .merge(resources::router(state.clone()))
        .merge(orch::router(state))
}

pub fn build_metrics_router() -> Router<AppState> {
    Router::<AppState>::new().route("/metrics", get(render_metrics))
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    state.metrics_handle.render()
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> ApiResult<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::auth_required("missing authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::auth_required("malformed bearer token"))
}

/// Resolve the bearer token to a user through the token store.
pub(crate) async fn require_user(state: &AppState, headers: &HeaderMap) -> ApiResult<UserRecord> {
    let token = bearer_token(headers)?;
    let record = persistence::iam::resolve_token(&state.db, &hash_token(&token))
        .await?
        .ok_or_else(|| AppError::auth_required("unknown token"))?;

    if record.expires_at < Utc::now() {
        return Err(AppError::auth_required("token expired"));
    }

    persistence::iam::get_user(&state.db, record.user_id)
        .await?
        .ok_or_else(|| AppError::auth_required("token subject no longer exists"))
}

/// Agents authenticate either with the static bootstrap credential from
/// configuration, or with an access token minted by the user API for an
/// agent user that holds the orch permission.
pub(crate) async fn require_agent(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let token = bearer_token(headers)?;
    if state.is_agent_token(&token) {
        return Ok(());
    }

    let user = require_user(state, headers).await?;
    state
        .authz
        .check(
            user.uuid,
            common::api::SERVICE_PROJECT_ID,
            "em_core.agents.manage",
        )
        .await
}

/// Deny-by-default permission check inside the transaction that carries the
/// guarded mutation.
pub(crate) async fn check_permission_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    subject: Uuid,
    project: Uuid,
    required: &str,
) -> ApiResult<()> {
    let names = persistence::iam::resolve_permission_names_tx(tx, subject, project).await?;
    let allowed = names.iter().any(|stored| permission_matches(stored, required));
    telemetry::record_authz_decision(allowed);
    if allowed {
        Ok(())
    } else {
        Err(AppError::permission_denied(format!(
            "subject lacks permission {required}"
        )))
    }
}
