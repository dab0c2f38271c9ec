use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;

use crate::config::{IamConfig, OutboxConfig, ReconcilerConfig};
use crate::iam::AuthzKernel;
use crate::persistence::Db;
use crate::scheduler::CapabilityScheduler;

/// Shared application state passed into handlers and background loops.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub authz: AuthzKernel,
    pub scheduler: CapabilityScheduler,
    /// Kinds this deployment's reconciler claims, resolved from the
    /// `scheduler.capabilities` label list at startup.
    pub scheduled_kinds: Vec<common::api::ResourceKind>,
    pub agent_token: String,
    pub iam: IamConfig,
    pub reconciler: ReconcilerConfig,
    pub outbox: OutboxConfig,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    /// Constant-time comparison of the static agent credential.
    pub fn is_agent_token(&self, candidate: &str) -> bool {
        if self.agent_token.len() != candidate.len() {
            return false;
        }
        self.agent_token
            .as_bytes()
            .ct_eq(candidate.as_bytes())
            .into()
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
