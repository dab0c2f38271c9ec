use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{config, drivers, heartbeat, reconcile, state, telemetry, validate_endpoints};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Install a Prometheus recorder for the agent's counters.
    pub init_metrics: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            init_metrics: true,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown when embedded.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "agent task panicked during shutdown");
                    anyhow::bail!("agent task panicked");
                }
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the universal agent using the provided configuration and options.
pub async fn start_agent(
    cfg: config::AppConfig,
    options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }
    if options.init_metrics {
        let _ = telemetry::init_metrics_recorder();
    }

    validate_endpoints(&cfg)?;
    let node_id = cfg.universal_agent.resolve_node_id()?;
    let drivers = drivers::build_drivers(&cfg)?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.universal_agent.http_timeout_secs))
        .timeout(Duration::from_secs(cfg.universal_agent.http_timeout_secs))
        .build()?;
    let state = state::SharedState::new(cfg, node_id, client);

    info!(
        node_id = %state.node_id,
        orch = %state.cfg.universal_agent.orch_endpoint,
        status = %state.cfg.universal_agent.status_endpoint,
        drivers = drivers.len(),
        "universal agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    heartbeat::register_until_ready(&state, shutdown_rx.clone()).await?;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let hb_state = state.clone();
    let hb_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = heartbeat::heartbeat_loop(hb_state, hb_shutdown).await {
            error!(?err, "heartbeat loop terminated with error");
        }
    }));

    let rc_state = state.clone();
    let rc_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = reconcile::reconcile_loop(rc_state, drivers, rc_shutdown).await {
            error!(?err, "reconcile loop terminated with error");
        }
    }));

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
