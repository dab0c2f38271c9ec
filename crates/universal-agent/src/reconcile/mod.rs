use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cp_client::{OrchApi, OrchClient};
use crate::drivers::DynCapabilityDriver;
use crate::state::{jittered_poll_period, SharedState};
use crate::telemetry;

pub mod apply;

pub use apply::{reconcile_kind, KindReport};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: usize,
    pub fetch_failures: usize,
}

impl TickReport {
    fn absorb(&mut self, kind: &KindReport) {
        self.created += kind.created;
        self.updated += kind.updated;
        self.deleted += kind.deleted;
        self.errors += kind.errors;
        if kind.fetch_failed {
            self.fetch_failures += 1;
        }
    }
}

/// One agent iteration: every driver reconciles its kind in parallel;
/// operations on a single identifier are serialized through the shared
/// mutex table.
pub async fn reconcile_tick<C>(
    state: &SharedState,
    client: &C,
    drivers: &[DynCapabilityDriver],
) -> anyhow::Result<TickReport>
where
    C: OrchApi + Clone + Send + Sync + 'static,
{
    let started = Instant::now();
    let mut set: JoinSet<anyhow::Result<KindReport>> = JoinSet::new();

    for driver in drivers {
        let driver = Arc::clone(driver);
        let state = state.clone();
        let client = client.clone();
        set.spawn(async move { reconcile_kind(&state, &client, driver).await });
    }

    let mut report = TickReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(kind_report)) => report.absorb(&kind_report),
            Ok(Err(err)) => {
                warn!(?err, "driver reconciliation failed");
                report.errors += 1;
            }
            Err(join_err) => {
                error!(?join_err, "driver task panicked");
                report.errors += 1;
            }
        }
    }

    telemetry::record_tick(&report, started.elapsed());
    Ok(report)
}

/// The agent's main loop: poll with a jittered seconds-scale period until
/// shutdown. Each tick is self-contained; a failed tick leaves convergence
/// to the next one.
pub async fn reconcile_loop(
    state: SharedState,
    drivers: Vec<DynCapabilityDriver>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = OrchClient::new(state.node_id);
    info!(
        node_id = %state.node_id,
        drivers = drivers.len(),
        "universal agent reconcile loop starting"
    );

    loop {
        let period = jittered_poll_period(&state.cfg.universal_agent);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {
                if let Err(err) = reconcile_tick(&state, &client, &drivers).await {
                    error!(?err, "reconcile tick failed");
                }
            }
        }
    }

    Ok(())
}
