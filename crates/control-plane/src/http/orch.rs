use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use common::api::{
    AgentHeartbeat, AgentRegistration, AssignedTargetsResponse, CertificateIssuedPayload,
    EventKind, ResourceKind, ResourceStatus, StatusReport,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::http::require_agent;
use crate::persistence::{self, NewAgent};
use crate::telemetry;

pub fn router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/orch/agents/register", post(register_agent))
        .route("/v1/orch/agents/{uuid}/heartbeats", post(heartbeat))
        .route("/v1/orch/agents/{uuid}/targets", get(fetch_targets))
        .route("/v1/status/actuals", post(push_actuals))
}

async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AgentRegistration>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_agent(&state, &headers).await?;
    if body.capabilities.is_empty() {
        return Err(AppError::validation("agents must advertise at least one capability"));
    }

    let record = persistence::agents::upsert_agent(
        &state.db,
        NewAgent {
            uuid: body.uuid,
            name: body.name,
            capabilities: body.capabilities,
        },
    )
    .await?;
    info!(agent = %record.uuid, capabilities = ?record.capabilities.0, "agent registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "uuid": record.uuid,
            "name": record.name,
            "capabilities": record.capabilities.0,
        })),
    ))
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
    Json(body): Json<AgentHeartbeat>,
) -> ApiResult<StatusCode> {
    require_agent(&state, &headers).await?;
    if body.uuid != uuid {
        return Err(AppError::validation("heartbeat uuid does not match the path"));
    }

    let touched = persistence::agents::touch_heartbeat(&state.db, uuid, Utc::now()).await?;
    if touched == 0 {
        return Err(AppError::not_found("agent is not registered"));
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct TargetsQuery {
    kind: String,
}

async fn fetch_targets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<Uuid>,
    Query(query): Query<TargetsQuery>,
) -> ApiResult<Json<AssignedTargetsResponse>> {
    require_agent(&state, &headers).await?;
    let kind = ResourceKind::parse(&query.kind)
        .ok_or_else(|| AppError::validation(format!("unknown capability kind {}", query.kind)))?;

    let records = persistence::resources::assigned_targets(&state.db, uuid, kind).await?;
    let targets = records
        .iter()
        .map(|record| record.envelope())
        .collect::<crate::Result<Vec<_>>>()?;

    Ok(Json(AssignedTargetsResponse { targets }))
}

/// Status push: the agent's post-diff actual set for one capability kind.
///
/// The set replaces the stored actuals for that (agent, kind). Permanent
/// driver failures arrive as actuals in ERROR and move their target to ERROR
/// here; certificate convergence emits the issued event.
async fn push_actuals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> ApiResult<StatusCode> {
    require_agent(&state, &headers).await?;
    telemetry::record_status_report(report.kind.as_str());

    for actual in &report.actuals {
        if actual.kind != report.kind {
            return Err(AppError::validation(
                "status report contains an actual of a foreign kind",
            ));
        }
    }

    for actual in &report.actuals {
        match actual.status {
            ResourceStatus::Error => {
                let reason = actual
                    .spec
                    .get("error")
                    .and_then(|value| value.as_str())
                    .unwrap_or("driver reported a permanent failure")
                    .to_string();
                persistence::resources::fail_target(&state.db, actual.uuid, &reason).await?;
            }
            ResourceStatus::Active if report.kind == ResourceKind::Certificate => {
                let converged_new = persistence::resources::get_target(&state.db, actual.uuid)
                    .await?
                    .map(|target| target.status != ResourceStatus::Active.as_str())
                    .unwrap_or(false);
                if converged_new {
                    let not_after = actual
                        .spec
                        .get("not_after")
                        .and_then(|value| serde_json::from_value(value.clone()).ok())
                        .unwrap_or_else(Utc::now);
                    let payload = serde_json::to_value(CertificateIssuedPayload {
                        certificate_id: actual.uuid,
                        not_after,
                    })
                    .map_err(anyhow::Error::from)?;
                    persistence::outbox::enqueue(
                        &state.db,
                        EventKind::SecretCertificateIssued,
                        1,
                        &payload,
                    )
                    .await?;
                }
            }
            _ => {}
        }
    }

    persistence::resources::replace_actual_set(
        &state.db,
        report.agent_uuid,
        report.kind,
        &report.actuals,
    )
    .await?;

    Ok(StatusCode::OK)
}
