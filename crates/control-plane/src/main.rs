#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::init_tracing();
    let options = control_plane::parse_command_args(std::env::args().skip(1))?;
    tracing::info!(?options, "control-plane starting");
    control_plane::run(options).await
}
