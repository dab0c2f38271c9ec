use std::time::Duration;

use chrono::Utc;
use common::api::{ResourceKind, ResourceStatus};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::backoff;
use crate::persistence::{self, TargetRecord};
use crate::telemetry;
use crate::Result;

pub mod fanout;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub claimed: usize,
    pub activated: usize,
    pub errored: usize,
    pub deferred: usize,
    pub expanded: usize,
    pub removed: usize,
    pub orphans_swept: usize,
}

/// Resource kind families; each gets its own orchestrator worker.
pub fn kind_families(scheduled: &[ResourceKind]) -> Vec<(&'static str, Vec<ResourceKind>)> {
    let families: [(&'static str, &[ResourceKind]); 4] = [
        (
            "compute",
            &[
                ResourceKind::ComputeNode,
                ResourceKind::MachinePool,
                ResourceKind::NodeSet,
            ],
        ),
        ("em", &[ResourceKind::Service, ResourceKind::ServiceNode]),
        ("secret", &[ResourceKind::Password, ResourceKind::Certificate]),
        (
            "network",
            &[
                ResourceKind::LoadBalancer,
                ResourceKind::Vhost,
                ResourceKind::Route,
                ResourceKind::BackendPool,
                ResourceKind::Network,
                ResourceKind::Subnet,
                ResourceKind::Interface,
            ],
        ),
    ];

    families
        .into_iter()
        .map(|(name, members)| {
            let kinds: Vec<ResourceKind> = members
                .iter()
                .copied()
                .filter(|kind| scheduled.contains(kind))
                .collect();
            (name, kinds)
        })
        .filter(|(_, kinds)| !kinds.is_empty())
        .collect()
}

/// One cluster-wide reconciliation pass over every scheduled kind: claim due
/// targets, resolve placement, fan services out, converge statuses against
/// the actual plane, and cascade deletions.
pub async fn run_reconcile_pass(state: &AppState) -> Result<PassReport> {
    let kinds = state.scheduled_kinds.clone();
    run_reconcile_pass_for(state, &kinds).await
}

/// One worker pass restricted to a kind family.
pub async fn run_reconcile_pass_for(
    state: &AppState,
    kinds: &[ResourceKind],
) -> Result<PassReport> {
    let mut report = PassReport::default();
    let now = Utc::now();
    let lease = chrono::Duration::seconds(state.reconciler.lease_secs as i64);

    let claims = persistence::resources::claim_due(
        &state.db,
        kinds,
        now,
        lease,
        state.reconciler.batch_size,
    )
    .await?;
    report.claimed = claims.len();

    for claim in claims {
        let outcome = reconcile_one(state, &claim).await;
        match outcome {
            Ok(one) => {
                report.activated += one.activated;
                report.errored += one.errored;
                report.deferred += one.deferred;
                report.expanded += one.expanded;
                report.removed += one.removed;
            }
            Err(err) => {
                warn!(target = %claim.uuid, kind = %claim.kind, ?err, "reconcile step failed");
                telemetry::record_reconcile_outcome("step_error");
            }
        }
    }

    report.orphans_swept = sweep_orphan_actuals(state).await?;
    Ok(report)
}

#[derive(Debug, Default, Clone, Copy)]
struct StepReport {
    activated: usize,
    errored: usize,
    deferred: usize,
    expanded: usize,
    removed: usize,
}

async fn reconcile_one(state: &AppState, claim: &TargetRecord) -> Result<StepReport> {
    let status = claim.status()?;
    let kind = claim.kind()?;

    match status {
        ResourceStatus::Deleting => reconcile_deleting(state, claim).await,
        ResourceStatus::InProgress => match kind {
            ResourceKind::Service => reconcile_service(state, claim).await,
            ResourceKind::LoadBalancer
            | ResourceKind::Vhost
            | ResourceKind::Route
            | ResourceKind::BackendPool
            | ResourceKind::MachinePool
            | ResourceKind::NodeSet
            | ResourceKind::Network
            | ResourceKind::Subnet
            | ResourceKind::Interface => {
                // No node-local driver behind these kinds; invariants were
                // validated at write time and downstream integrations (LB
                // dataplane, DHCP rendering) consume the stored rows.
                persistence::resources::activate_target(&state.db, claim.uuid).await?;
                telemetry::record_reconcile_outcome("activated");
                Ok(StepReport {
                    activated: 1,
                    ..Default::default()
                })
            }
            _ => reconcile_agent_kind(state, claim).await,
        },
        // NEW rows leave the claim as IN_PROGRESS; ACTIVE and ERROR rows are
        // never claimed.
        _ => Ok(StepReport::default()),
    }
}

/// Dependents are marked DELETING deepest-first; physical removal then runs
/// bottom-up once each node of the subtree has no remaining children and its
/// agent (if any) confirmed the actual is gone.
async fn reconcile_deleting(state: &AppState, claim: &TargetRecord) -> Result<StepReport> {
    let mut report = StepReport::default();

    // Collect the subtree level by level, then mark from the deepest level
    // up so route-level leaves transition before their vhost parents.
    let mut levels: Vec<Vec<TargetRecord>> = Vec::new();
    let mut frontier = persistence::resources::children_of(&state.db, claim.uuid).await?;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for child in &frontier {
            next.extend(persistence::resources::children_of(&state.db, child.uuid).await?);
        }
        levels.push(frontier);
        frontier = next;
    }

    let mut has_children = false;
    for level in levels.iter().rev() {
        for child in level {
            has_children = true;
            if child.status()? != ResourceStatus::Deleting {
                persistence::resources::mark_deleting(&state.db, child.uuid).await?;
            }
        }
    }
    if has_children {
        return Ok(report);
    }

    let kind = claim.kind()?;
    let agent_must_confirm = kind.is_agent_kind() && claim.agent_id.is_some();
    if agent_must_confirm {
        if persistence::resources::get_actual(&state.db, claim.uuid)
            .await?
            .is_some()
        {
            // The agent still reports the actual; it deletes the local
            // resource on its next tick and the report drop clears the row.
            return Ok(report);
        }
    }

    persistence::resources::remove_pair(&state.db, claim.uuid).await?;
    telemetry::record_reconcile_outcome("removed");
    report.removed = 1;
    Ok(report)
}

async fn reconcile_service(state: &AppState, claim: &TargetRecord) -> Result<StepReport> {
    let mut report = StepReport::default();

    let spec = match fanout::parse_service_spec(&claim.spec.0) {
        Ok(spec) => spec,
        Err(reason) => {
            persistence::resources::fail_target(&state.db, claim.uuid, &reason).await?;
            telemetry::record_reconcile_outcome("errored");
            report.errored = 1;
            return Ok(report);
        }
    };

    let expansion = fanout::expand_service(&state.db, claim, &spec).await?;
    report.expanded = expansion.created + expansion.removed;
    if expansion.converged {
        persistence::resources::activate_target(&state.db, claim.uuid).await?;
        telemetry::record_reconcile_outcome("activated");
        report.activated = 1;
    }
    Ok(report)
}

async fn reconcile_agent_kind(state: &AppState, claim: &TargetRecord) -> Result<StepReport> {
    let mut report = StepReport::default();
    let kind = claim.kind()?;

    if claim.agent_id.is_none() {
        return place_target(state, claim, kind).await;
    }

    let Some(actual) = persistence::resources::get_actual(&state.db, claim.uuid).await? else {
        // Assigned but not yet realized; the lease expiry re-checks.
        return Ok(report);
    };

    match actual.status()? {
        ResourceStatus::Error => {
            let reason = actual
                .spec
                .0
                .get("error")
                .and_then(|value| value.as_str())
                .unwrap_or("driver reported a permanent failure")
                .to_string();
            persistence::resources::fail_target(&state.db, claim.uuid, &reason).await?;
            telemetry::record_reconcile_outcome("errored");
            report.errored = 1;
        }
        ResourceStatus::Active if actual.version >= claim.version => {
            persistence::resources::activate_target(&state.db, claim.uuid).await?;
            telemetry::record_reconcile_outcome("activated");
            report.activated = 1;
        }
        // Converged against an older version; wait for the agent to catch up.
        _ => {}
    }

    Ok(report)
}

/// Resolve placement for an unassigned target. Service-node projections are
/// pinned to their node's agent; everything else goes through the capability
/// scheduler. Absence of an eligible agent defers the target with backoff
/// and, past the attempt threshold, parks it in ERROR.
async fn place_target(
    state: &AppState,
    claim: &TargetRecord,
    kind: ResourceKind,
) -> Result<StepReport> {
    let mut report = StepReport::default();

    let placed: Option<Uuid> = match kind {
        ResourceKind::ServiceNode => {
            let node_id = claim
                .spec
                .0
                .get("node_id")
                .and_then(|value| value.as_str())
                .and_then(|value| Uuid::parse_str(value).ok());
            match node_id {
                Some(node_id) => {
                    let stale_after = Utc::now()
                        - chrono::Duration::seconds(state.reconciler.lease_secs as i64 * 3);
                    persistence::agents::live_agents_with_load(&state.db, stale_after)
                        .await?
                        .into_iter()
                        .find(|agent| agent.uuid == node_id)
                        .map(|agent| agent.uuid)
                }
                None => None,
            }
        }
        _ => state.scheduler.place(kind).await?,
    };

    match placed {
        Some(agent_id) => {
            persistence::resources::assign_agent(&state.db, claim.uuid, agent_id).await?;
            info!(target = %claim.uuid, kind = kind.as_str(), agent = %agent_id, "target placed");
        }
        None => {
            let attempts = claim.attempts + 1;
            if attempts >= state.reconciler.max_attempts {
                persistence::resources::fail_target(
                    &state.db,
                    claim.uuid,
                    "no eligible agent advertises this capability",
                )
                .await?;
                telemetry::record_reconcile_outcome("errored");
                report.errored = 1;
            } else {
                let delay = backoff::exponential(
                    Duration::from_secs(state.reconciler.backoff_base_secs),
                    Duration::from_secs(state.reconciler.backoff_cap_secs),
                    attempts as u32,
                );
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
                persistence::resources::defer_target(&state.db, claim.uuid, retry_at).await?;
                telemetry::record_reconcile_outcome("deferred");
                report.deferred = 1;
            }
        }
    }

    Ok(report)
}

/// Actuals whose target is gone are garbage. Live agents clean their own up
/// through the diff loop; the sweep only reaps rows left behind by agents
/// that stopped heartbeating.
async fn sweep_orphan_actuals(state: &AppState) -> Result<usize> {
    let mut swept = 0;
    let orphans = persistence::resources::orphan_actuals(&state.db).await?;
    if orphans.is_empty() {
        return Ok(0);
    }

    let stale_after = Utc::now() - chrono::Duration::seconds(state.reconciler.lease_secs as i64 * 3);
    for orphan in orphans {
        let agent = persistence::agents::get_agent(&state.db, orphan.agent_id).await?;
        let live = agent
            .and_then(|agent| agent.last_heartbeat)
            .map(|at| at >= stale_after)
            .unwrap_or(false);
        if !live {
            persistence::resources::delete_actual(&state.db, orphan.uuid).await?;
            swept += 1;
        }
    }
    Ok(swept)
}

/// Spawns one worker per resource kind family and waits for all of them.
pub async fn reconciler_loop(
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let families = kind_families(&state.scheduled_kinds);
    info!(workers = families.len(), "orchestrator reconciler starting");

    let mut workers = Vec::new();
    for (family, kinds) in families {
        let state = state.clone();
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            family_worker_loop(state, family, kinds, shutdown).await;
        }));
    }

    for worker in workers {
        if let Err(join_err) = worker.await {
            error!(?join_err, "reconciler worker terminated abnormally");
        }
    }
    Ok(())
}

/// One kind-family worker. Each pass runs in its own task so a panic is
/// caught at the loop boundary and the worker restarts after a short delay.
async fn family_worker_loop(
    state: AppState,
    family: &'static str,
    kinds: Vec<ResourceKind>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.reconciler.interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let pass_state = state.clone();
                let pass_kinds = kinds.clone();
                let pass = tokio::spawn(async move {
                    run_reconcile_pass_for(&pass_state, &pass_kinds).await
                });
                match pass.await {
                    Ok(Ok(report)) => {
                        if report.claimed > 0 || report.orphans_swept > 0 {
                            info!(family, ?report, "reconcile pass finished");
                        }
                    }
                    Ok(Err(err)) => {
                        error!(family, ?err, "reconcile pass failed");
                    }
                    Err(join_err) if join_err.is_panic() => {
                        error!(family, ?join_err, "reconcile pass panicked; restarting after delay");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(join_err) => {
                        error!(family, ?join_err, "reconcile pass aborted");
                    }
                }
            }
        }
    }
}
