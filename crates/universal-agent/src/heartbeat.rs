use std::time::Duration;

use common::api::AgentRegistration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cp_client::{OrchApi, OrchClient};
use crate::state::SharedState;

const REGISTER_RETRY_SECS: u64 = 2;

/// Advertise the node identifier and capability set to the orchestrator.
/// Registration is idempotent on the node uuid; retried until the control
/// plane is reachable or shutdown is requested.
pub async fn register_until_ready(
    state: &SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = OrchClient::new(state.node_id);
    let registration = AgentRegistration {
        uuid: state.node_id,
        name: state.cfg.universal_agent.name.clone(),
        capabilities: state.cfg.universal_agent.driver_list(),
    };

    loop {
        if *shutdown.borrow() {
            anyhow::bail!("shutdown requested before registration completed");
        }
        match client.register(state, &registration).await {
            Ok(()) => {
                info!(
                    node_id = %state.node_id,
                    capabilities = ?registration.capabilities,
                    "agent registered"
                );
                return Ok(());
            }
            Err(err) => {
                warn!(?err, "agent registration failed; retrying");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                anyhow::bail!("shutdown requested before registration completed");
            }
            _ = tokio::time::sleep(Duration::from_secs(REGISTER_RETRY_SECS)) => {}
        }
    }
}

pub async fn heartbeat_loop(
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = OrchClient::new(state.node_id);
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.cfg.universal_agent.heartbeat_interval_secs.max(1),
    ));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(err) = client.heartbeat(&state).await {
                    warn!(?err, "heartbeat failed");
                }
            }
        }
    }

    Ok(())
}
