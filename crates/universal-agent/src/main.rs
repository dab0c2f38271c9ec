#[tokio::main]
async fn main() -> universal_agent::Result<()> {
    let options = universal_agent::parse_command_args(std::env::args().skip(1))?;
    let cfg = universal_agent::config::load(options.config_file.as_deref())?;

    let agent = universal_agent::runner::start_agent(
        cfg,
        universal_agent::runner::AgentOptions::default(),
    )
    .await?;

    universal_agent::runner::wait_for_shutdown_signal().await;
    agent.shutdown().await
}
