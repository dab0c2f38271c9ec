use serde::Deserialize;
use uuid::Uuid;

pub const ENV_PREFIX: &str = "GENESIS_UA";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub universal_agent: UniversalAgentConfig,
    pub auth: AuthConfig,
    pub core_driver: CoreDriverConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniversalAgentConfig {
    /// Node identifier this agent runs on; empty means a fresh uuid is
    /// generated at startup (throwaway nodes).
    #[serde(default)]
    pub node_id: String,
    pub name: String,
    /// Orchestrator endpoint: registration, heartbeats, target fetch.
    pub orch_endpoint: String,
    /// Status endpoint: actual push.
    pub status_endpoint: String,
    /// User API endpoint used to mint the access token.
    pub user_api_endpoint: String,
    /// Capability drivers to load, comma-separated labels.
    pub caps_drivers: String,
    pub poll_period_secs: u64,
    pub poll_jitter_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub http_timeout_secs: u64,
    /// Local work directory for driver state and materialized artifacts.
    pub work_dir: String,
}

impl UniversalAgentConfig {
    pub fn driver_list(&self) -> Vec<String> {
        self.caps_drivers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn resolve_node_id(&self) -> anyhow::Result<Uuid> {
        let trimmed = self.node_id.trim();
        if trimmed.is_empty() {
            return Ok(Uuid::new_v4());
        }
        Uuid::parse_str(trimmed)
            .map_err(|err| anyhow::anyhow!("universal_agent.node_id is not a uuid: {err}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// IAM user the agent authenticates as; empty falls back to the static
    /// agent credential without token minting.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: String,
    /// Static credential accepted by the orch/status endpoints.
    pub agent_token: String,
    /// Renew the cached access token this many seconds before expiry.
    pub token_renew_skew_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreDriverConfig {
    /// Machine pool this node allocates from.
    pub pool_name: String,
    /// Allocation capacity of the dummy pool backend.
    pub capacity: u32,
}

pub fn load(config_file: Option<&str>) -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let mut builder = config::Config::builder();
    builder = match config_file {
        Some(path) => builder.add_source(config::File::with_name(path)),
        None => builder.add_source(config::File::with_name("config").required(false)),
    };

    let builder = builder
        .add_source(env)
        .set_default("universal_agent.node_id", "")?
        .set_default("universal_agent.name", "universal-agent")?
        .set_default("universal_agent.orch_endpoint", "http://127.0.0.1:8080")?
        .set_default("universal_agent.status_endpoint", "http://127.0.0.1:8080")?
        .set_default("universal_agent.user_api_endpoint", "http://127.0.0.1:8080")?
        .set_default(
            "universal_agent.caps_drivers",
            "em_core_compute_nodes,em_core_service_nodes,password,certificate",
        )?
        .set_default("universal_agent.poll_period_secs", 3)?
        .set_default("universal_agent.poll_jitter_ms", 500)?
        .set_default("universal_agent.heartbeat_interval_secs", 15)?
        .set_default("universal_agent.http_timeout_secs", 10)?
        .set_default("universal_agent.work_dir", "/var/lib/genesis/universal_agent")?
        .set_default("auth.name", "")?
        .set_default("auth.secret", "")?
        .set_default("auth.agent_token", "dev-agent-token")?
        .set_default("auth.token_renew_skew_secs", 60)?
        .set_default("core_driver.pool_name", "default")?
        .set_default("core_driver.capacity", 32)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    if app.universal_agent.driver_list().is_empty() {
        anyhow::bail!("universal_agent.caps_drivers cannot be empty");
    }
    if app.universal_agent.poll_period_secs == 0 {
        anyhow::bail!("universal_agent.poll_period_secs must be > 0");
    }
    Ok(app)
}
