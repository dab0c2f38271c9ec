use async_trait::async_trait;
use chrono::Utc;
use common::api::{
    AgentHeartbeat, AgentRegistration, AssignedTargetsResponse, ResourceEnvelope, ResourceKind,
    StatusReport, TokenResponse,
};
use reqwest::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::SharedState;

/// The agent side of the control-plane wire contract: the orchestrator
/// endpoint (registration, heartbeats, target fetch) and the status endpoint
/// (actual push).
#[async_trait]
pub trait OrchApi: Send + Sync {
    async fn register(&self, state: &SharedState, registration: &AgentRegistration)
        -> anyhow::Result<()>;
    async fn heartbeat(&self, state: &SharedState) -> anyhow::Result<()>;
    async fn fetch_targets(
        &self,
        state: &SharedState,
        kind: ResourceKind,
    ) -> anyhow::Result<Vec<ResourceEnvelope>>;
    async fn push_actuals(
        &self,
        state: &SharedState,
        kind: ResourceKind,
        actuals: Vec<ResourceEnvelope>,
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct OrchClient {
    node_id: Uuid,
}

impl OrchClient {
    pub fn new(node_id: Uuid) -> Self {
        Self { node_id }
    }

    /// Resolve the bearer used against the orch/status endpoints.
    ///
    /// With an IAM identity configured the client mints an access token from
    /// the user API and caches it, renewing inside the configured skew
    /// before expiry. Without one it falls back to the static credential.
    async fn bearer(&self, state: &SharedState) -> anyhow::Result<String> {
        let auth = &state.cfg.auth;
        if auth.name.trim().is_empty() {
            return Ok(auth.agent_token.clone());
        }

        let skew = chrono::Duration::seconds(auth.token_renew_skew_secs as i64);
        if let Some(token) = state.token_cache().await.valid_token(Utc::now(), skew) {
            return Ok(token);
        }

        let url = format!(
            "{}/v1/iam/auth",
            state.cfg.universal_agent.user_api_endpoint.trim_end_matches('/')
        );
        let response = state
            .client
            .post(url)
            .json(&serde_json::json!({"name": auth.name, "secret": auth.secret}))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token mint failed: {status}, body: {body}");
        }

        let minted = response.json::<TokenResponse>().await?;
        debug!(expires_at = %minted.expires_at, "access token renewed");
        state
            .token_cache()
            .await
            .store(minted.token.clone(), minted.expires_at);
        Ok(minted.token)
    }

    async fn handle_auth_failure(&self, state: &SharedState, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED {
            // Token revoked or expired server-side; the next call re-mints.
            state.token_cache().await.clear();
        }
    }

    fn orch_url(&self, state: &SharedState, suffix: &str) -> String {
        format!(
            "{}{}",
            state.cfg.universal_agent.orch_endpoint.trim_end_matches('/'),
            suffix
        )
    }
}

#[async_trait]
impl OrchApi for OrchClient {
    async fn register(
        &self,
        state: &SharedState,
        registration: &AgentRegistration,
    ) -> anyhow::Result<()> {
        let bearer = self.bearer(state).await?;
        let url = self.orch_url(state, "/v1/orch/agents/register");
        let response = state
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(registration)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.handle_auth_failure(state, status).await;
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("agent registration failed: {status}, body: {body}");
        }
        Ok(())
    }

    async fn heartbeat(&self, state: &SharedState) -> anyhow::Result<()> {
        let bearer = self.bearer(state).await?;
        let url = self.orch_url(state, &format!("/v1/orch/agents/{}/heartbeats", self.node_id));
        let payload = AgentHeartbeat {
            uuid: self.node_id,
            timestamp: Utc::now(),
        };
        let response = state
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.handle_auth_failure(state, status).await;
            warn!(%status, "heartbeat rejected");
            anyhow::bail!("heartbeat failed: {status}");
        }
        Ok(())
    }

    async fn fetch_targets(
        &self,
        state: &SharedState,
        kind: ResourceKind,
    ) -> anyhow::Result<Vec<ResourceEnvelope>> {
        let bearer = self.bearer(state).await?;
        let url = self.orch_url(
            state,
            &format!("/v1/orch/agents/{}/targets?kind={}", self.node_id, kind.as_str()),
        );
        let response = state.client.get(url).bearer_auth(bearer).send().await?;

        let status = response.status();
        if !status.is_success() {
            self.handle_auth_failure(state, status).await;
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("target fetch failed: {status}, body: {body}");
        }

        let body = response.json::<AssignedTargetsResponse>().await?;
        Ok(body.targets)
    }

    async fn push_actuals(
        &self,
        state: &SharedState,
        kind: ResourceKind,
        actuals: Vec<ResourceEnvelope>,
    ) -> anyhow::Result<()> {
        let bearer = self.bearer(state).await?;
        let url = format!(
            "{}/v1/status/actuals",
            state.cfg.universal_agent.status_endpoint.trim_end_matches('/')
        );
        let report = StatusReport {
            agent_uuid: self.node_id,
            kind,
            actuals,
        };
        let response = state
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(&report)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.handle_auth_failure(state, status).await;
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("status push failed: {status}, body: {body}");
        }
        Ok(())
    }
}
