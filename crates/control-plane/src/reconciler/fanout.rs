use common::api::{ResourceKind, ResourceStatus, ServiceHook, ServiceNodeSpec, ServiceSpec};
use serde_json::Value;
use uuid::Uuid;

use crate::persistence::{self, Db, NewTarget, TargetRecord};
use crate::Result;

/// Deterministic monopoly election: the member with the smallest uuid wins,
/// regardless of which agent polls first.
pub fn elect_monopoly_node(members: &[Uuid]) -> Option<Uuid> {
    members.iter().min().copied()
}

pub fn parse_service_spec(spec: &Value) -> std::result::Result<ServiceSpec, String> {
    let service: ServiceSpec = serde_json::from_value(spec.clone())
        .map_err(|err| format!("invalid service spec: {err}"))?;

    let has_service_hook = service
        .before
        .iter()
        .chain(service.after.iter())
        .any(|hook| matches!(hook, ServiceHook::Service { .. }));
    if has_service_hook {
        return Err("service hooks of kind 'service' are not supported yet".to_string());
    }

    Ok(service)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionReport {
    pub created: usize,
    pub removed: usize,
    pub converged: bool,
}

/// Expand a service target into its per-node projections.
///
/// Simple/oneshot services get one ServiceNode per member; monopoly services
/// get exactly one on the elected node. Members that left the set have their
/// projections marked DELETING, and for monopoly services a replacement is
/// only created once the outgoing projection is fully gone, keeping the
/// fleet-wide replica count at one.
pub async fn expand_service(
    db: &Db,
    service: &TargetRecord,
    spec: &ServiceSpec,
) -> Result<ExpansionReport> {
    let mut report = ExpansionReport::default();

    let members = spec.target.members();
    let desired: Vec<Uuid> = if spec.service_type.is_monopoly() {
        elect_monopoly_node(&members).into_iter().collect()
    } else {
        members
    };

    let children = persistence::resources::children_of(db, service.uuid).await?;
    let mut draining = false;
    for child in &children {
        if child.status()? == ResourceStatus::Deleting {
            draining = true;
            continue;
        }
        let node_id = child_node_id(child);
        let keep = node_id.map(|id| desired.contains(&id)).unwrap_or(false);
        if !keep {
            persistence::resources::mark_deleting(db, child.uuid).await?;
            report.removed += 1;
            draining = true;
        }
    }

    for node_id in &desired {
        let exists = children.iter().any(|child| {
            child_node_id(child) == Some(*node_id)
                && child.status().map(|s| s != ResourceStatus::Deleting).unwrap_or(false)
        });
        if exists {
            continue;
        }
        if spec.service_type.is_monopoly() && draining {
            // The outgoing replica still exists somewhere; creating the
            // replacement now could put two replicas on the fleet at once.
            continue;
        }

        let projection = ServiceNodeSpec {
            service_id: service.uuid,
            node_id: *node_id,
            name: spec.name.clone(),
            service_type: spec.service_type,
            command: spec.command.clone(),
            user: spec.user.clone(),
            group: spec.group.clone(),
            before: spec.before.clone(),
            after: spec.after.clone(),
        };
        let mut new_target = NewTarget::new(
            ResourceKind::ServiceNode,
            service.project_id,
            serde_json::to_value(&projection)?,
        );
        new_target.parent_id = Some(service.uuid);
        persistence::resources::create_target(db, new_target).await?;
        report.created += 1;
    }

    if report.created == 0 && report.removed == 0 && !children.is_empty() {
        report.converged = children
            .iter()
            .filter(|child| child.status().map(|s| s != ResourceStatus::Deleting).unwrap_or(true))
            .all(|child| child.status().map(|s| s == ResourceStatus::Active).unwrap_or(false))
            && children
                .iter()
                .any(|child| child.status().map(|s| s == ResourceStatus::Active).unwrap_or(false));
    }

    Ok(report)
}

fn child_node_id(child: &TargetRecord) -> Option<Uuid> {
    child
        .spec
        .0
        .get("node_id")
        .and_then(|value| value.as_str())
        .and_then(|value| Uuid::parse_str(value).ok())
}
