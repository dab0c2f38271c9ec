pub mod config;
pub mod cp_client;
pub mod drivers;
pub mod heartbeat;
pub mod reconcile;
pub mod runner;
pub mod state;
pub mod telemetry;
pub mod test_support;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Startup options parsed from argv: `--config-file <path>` or
/// `--config-dir <dir>` (reads `<dir>/config.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub config_file: Option<String>,
}

pub fn parse_command_args<I: Iterator<Item = String>>(mut args: I) -> Result<CommandOptions> {
    let mut options = CommandOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-file" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config-file requires a path"))?;
                options.config_file = Some(path);
            }
            "--config-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config-dir requires a directory"))?;
                options.config_file = Some(format!("{}/config", dir.trim_end_matches('/')));
            }
            "--help" | "-h" => {
                println!("Usage: genesis-universal-agent [--config-file <path> | --config-dir <dir>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

pub fn validate_endpoints(cfg: &config::AppConfig) -> Result<()> {
    for (key, value) in [
        ("universal_agent.orch_endpoint", &cfg.universal_agent.orch_endpoint),
        ("universal_agent.status_endpoint", &cfg.universal_agent.status_endpoint),
        (
            "universal_agent.user_api_endpoint",
            &cfg.universal_agent.user_api_endpoint,
        ),
    ] {
        if !value.starts_with("http://") && !value.starts_with("https://") {
            anyhow::bail!("{key} must be an http(s) url, got {value}");
        }
    }
    Ok(())
}
