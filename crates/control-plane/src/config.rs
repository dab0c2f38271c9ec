use serde::Deserialize;

pub const ENV_PREFIX: &str = "GENESIS_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub db: DatabaseConfig,
    pub iam: IamConfig,
    pub orch: OrchConfig,
    pub reconciler: ReconcilerConfig,
    pub universal_agent_scheduler: SchedulerConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub connection_url: String,
    pub connection_pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IamConfig {
    /// Secret of the bootstrap admin user; hashed into the seeded row on
    /// startup so the seed value itself never authenticates.
    pub bootstrap_admin_secret: String,
    pub token_ttl_secs: u64,
    /// Upper bound on in-process permission memoization, in milliseconds.
    /// Memo entries are also dropped on every role/permission write.
    pub memo_ttl_ms: u64,
    /// Site endpoint embedded into registration/reset event payloads.
    pub site_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchConfig {
    /// Static credential agents present on the orch and status endpoints.
    pub agent_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub lease_secs: u64,
    pub batch_size: i64,
    pub max_attempts: i64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Heartbeats older than this exclude an agent from placement.
    pub heartbeat_stale_secs: u64,
    /// Capability labels this deployment schedules, comma-separated with
    /// wildcards (`em_core_*`). Targets of other kinds are left unclaimed.
    pub capabilities: String,
}

impl SchedulerConfig {
    pub fn capability_list(&self) -> Vec<String> {
        self.capabilities
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    pub interval_secs: u64,
    pub max_attempts: i64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
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
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.metrics_port", 9090)?
        .set_default("db.connection_url", "sqlite://data/genesis-core.db")?
        .set_default("db.connection_pool_size", 5)?
        .set_default("iam.bootstrap_admin_secret", "dev-admin-secret")?
        .set_default("iam.token_ttl_secs", 3600)?
        .set_default("iam.memo_ttl_ms", 250)?
        .set_default("iam.site_endpoint", "http://localhost:8080")?
        .set_default("orch.agent_token", "dev-agent-token")?
        .set_default("reconciler.interval_secs", 3)?
        .set_default("reconciler.lease_secs", 30)?
        .set_default("reconciler.batch_size", 50)?
        .set_default("reconciler.max_attempts", 10)?
        .set_default("reconciler.backoff_base_secs", 1)?
        .set_default("reconciler.backoff_cap_secs", 60)?
        .set_default("universal_agent_scheduler.heartbeat_stale_secs", 90)?
        .set_default(
            "universal_agent_scheduler.capabilities",
            "em_core_*,password,certificate",
        )?
        .set_default("outbox.interval_secs", 1)?
        .set_default("outbox.max_attempts", 8)?
        .set_default("outbox.backoff_base_secs", 1)?
        .set_default("outbox.backoff_cap_secs", 60)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    if app.orch.agent_token.trim().is_empty() {
        anyhow::bail!("orch.agent_token cannot be empty");
    }
    if app.iam.bootstrap_admin_secret.trim().is_empty() {
        anyhow::bail!("iam.bootstrap_admin_secret cannot be empty");
    }
    Ok(app)
}
