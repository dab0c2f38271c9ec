//! Shared helpers for unit and integration tests.

use uuid::Uuid;

use crate::config::{AppConfig, AuthConfig, CoreDriverConfig, UniversalAgentConfig};
use crate::state::SharedState;

pub fn base_config() -> AppConfig {
    let work_dir = std::env::temp_dir().join(format!("genesis-ua-test-{}", Uuid::new_v4()));
    AppConfig {
        universal_agent: UniversalAgentConfig {
            node_id: String::new(),
            name: "test-agent".into(),
            orch_endpoint: "http://127.0.0.1:8080".into(),
            status_endpoint: "http://127.0.0.1:8080".into(),
            user_api_endpoint: "http://127.0.0.1:8080".into(),
            caps_drivers: "em_core_compute_nodes,em_core_service_nodes,password,certificate".into(),
            poll_period_secs: 1,
            poll_jitter_ms: 50,
            heartbeat_interval_secs: 1,
            http_timeout_secs: 2,
            work_dir: work_dir.to_string_lossy().into_owned(),
        },
        auth: AuthConfig {
            name: String::new(),
            secret: String::new(),
            agent_token: "dev-agent-token".into(),
            token_renew_skew_secs: 60,
        },
        core_driver: CoreDriverConfig {
            pool_name: "default".into(),
            capacity: 8,
        },
    }
}

/// State wired against the given control-plane base url.
pub fn make_test_state(base_url: &str, node_id: Uuid) -> SharedState {
    let mut cfg = base_config();
    let base = base_url.trim_end_matches('/').to_string();
    cfg.universal_agent.orch_endpoint = base.clone();
    cfg.universal_agent.status_endpoint = base.clone();
    cfg.universal_agent.user_api_endpoint = base;
    cfg.universal_agent.node_id = node_id.to_string();
    SharedState::new(cfg, node_id, reqwest::Client::new())
}
