use std::collections::HashMap;

use chrono::Utc;
use common::api::{ResourceEnvelope, ResourceStatus};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cp_client::OrchApi;
use crate::drivers::{DriverError, DynCapabilityDriver};
use crate::state::SharedState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: usize,
    pub fetch_failed: bool,
}

/// Reconcile one capability kind: fetch assigned targets, diff against the
/// driver's local actuals by identifier, realize the difference, and push
/// the post-diff actual set to the status endpoint.
///
/// Transient failures are skipped and retried on the next tick; every other
/// driver failure is reported as an ERROR actual so the orchestrator parks
/// the target with a durable reason.
pub async fn reconcile_kind<C: OrchApi>(
    state: &SharedState,
    client: &C,
    driver: DynCapabilityDriver,
) -> anyhow::Result<KindReport> {
    let kind = driver.kind();
    let mut report = KindReport::default();

    let targets = match client.fetch_targets(state, kind).await {
        Ok(targets) => targets,
        Err(err) => {
            warn!(kind = kind.as_str(), ?err, "target fetch failed");
            report.fetch_failed = true;
            return Ok(report);
        }
    };

    let actuals = driver
        .list_actual()
        .await
        .map_err(|err| anyhow::anyhow!("list_actual for {}: {err}", kind.as_str()))?;
    let mut actual_by_id: HashMap<Uuid, ResourceEnvelope> =
        actuals.into_iter().map(|actual| (actual.uuid, actual)).collect();

    let mut reported: Vec<ResourceEnvelope> = Vec::new();

    let deadline = driver.operation_deadline();
    for target in &targets {
        let _guard = state.lock_identifier(target.uuid).await;
        let prior = actual_by_id.remove(&target.uuid);

        let outcome = match &prior {
            None => with_deadline(deadline, driver.create(target)).await.map(Some),
            Some(prior) if prior.version < target.version => {
                with_deadline(deadline, driver.update(target, prior)).await.map(Some)
            }
            // Converged already; report the known actual untouched.
            Some(existing) => Ok(Some(existing.clone())),
        };

        match outcome {
            Ok(Some(actual)) => {
                match &prior {
                    None => report.created += 1,
                    Some(prior) if prior.version < target.version => report.updated += 1,
                    Some(_) => {}
                }
                reported.push(actual);
            }
            Ok(None) => {}
            Err(err) if err.is_transient() => {
                warn!(
                    kind = kind.as_str(),
                    target = %target.uuid,
                    %err,
                    "transient driver failure; retrying next tick"
                );
                // Keep whatever we knew about the identifier.
                if let Some(prior) = prior {
                    reported.push(prior);
                }
            }
            Err(err) => {
                warn!(
                    kind = kind.as_str(),
                    target = %target.uuid,
                    %err,
                    "driver failure; reporting error actual"
                );
                report.errors += 1;
                reported.push(error_actual(target, &err));
            }
        }
    }

    // Actual present, target absent: the resource should not exist here.
    for (uuid, actual) in actual_by_id {
        let _guard = state.lock_identifier(uuid).await;
        match with_deadline(deadline, driver.delete(&actual)).await {
            Ok(()) => {
                info!(kind = kind.as_str(), actual = %uuid, "local resource removed");
                report.deleted += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(kind = kind.as_str(), actual = %uuid, %err, "transient delete failure");
                reported.push(actual);
            }
            Err(err) => {
                warn!(kind = kind.as_str(), actual = %uuid, %err, "delete failed permanently");
                report.errors += 1;
                // Dropping the actual would read as a confirmed removal, so
                // keep reporting it until an operator intervenes.
                reported.push(actual);
            }
        }
    }

    client.push_actuals(state, kind, reported).await?;
    Ok(report)
}

async fn with_deadline<T>(
    deadline: std::time::Duration,
    operation: impl std::future::Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Transient("operation deadline exceeded".into())),
    }
}

fn error_actual(target: &ResourceEnvelope, err: &DriverError) -> ResourceEnvelope {
    ResourceEnvelope {
        uuid: target.uuid,
        kind: target.kind,
        project_id: target.project_id,
        version: target.version,
        status: ResourceStatus::Error,
        spec: json!({"error": err.to_string()}),
        observed_at: Utc::now(),
    }
}
