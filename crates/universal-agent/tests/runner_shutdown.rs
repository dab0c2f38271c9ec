use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use tokio::time::{timeout, Duration};

use universal_agent::runner::{start_agent, AgentOptions};
use universal_agent::test_support::base_config;

/// The agent registers on startup and stops all loops promptly when
/// shutdown is requested.
#[tokio::test]
async fn agent_starts_registers_and_shuts_down_cleanly() {
    let server = MockServer::start();

    let register_mock = server.mock(|when, then| {
        when.method(POST).path("/v1/orch/agents/register");
        then.status(201).json_body(serde_json::json!({
            "uuid": uuid::Uuid::new_v4(),
            "name": "test-agent",
            "capabilities": ["password"],
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path_contains("/targets");
        then.status(200).json_body(serde_json::json!({"targets": []}));
    });
    server.mock(|when, then| {
        when.method(POST).path_contains("/heartbeats");
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(POST).path("/v1/status/actuals");
        then.status(200);
    });

    let workdir = tempfile::tempdir().expect("tempdir");
    let mut cfg = base_config();
    let base = server.url("");
    cfg.universal_agent.orch_endpoint = base.clone();
    cfg.universal_agent.status_endpoint = base.clone();
    cfg.universal_agent.user_api_endpoint = base;
    cfg.universal_agent.work_dir = workdir.path().to_string_lossy().into_owned();

    let agent = start_agent(
        cfg,
        AgentOptions {
            init_tracing: false,
            init_metrics: false,
        },
    )
    .await
    .expect("agent starts");

    assert_eq!(register_mock.hits(), 1, "capabilities advertised on startup");

    let shutdown = timeout(Duration::from_secs(5), agent.shutdown()).await;
    assert!(shutdown.is_ok(), "agent must stop promptly on shutdown");
    shutdown.unwrap().expect("clean shutdown");
}
