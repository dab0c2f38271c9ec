use chrono::{Duration, Utc};
use common::api::ResourceKind;
use uuid::Uuid;

use crate::persistence::{self, Db};
use crate::Result;

/// Matches an advertised capability label against a concrete kind. Labels may
/// end in `*` to cover a kind family (`em_core_*`).
pub fn capability_matches(advertised: &str, kind: &str) -> bool {
    match advertised.strip_suffix('*') {
        Some(prefix) => kind.starts_with(prefix),
        None => advertised == kind,
    }
}

/// Picks the agent a target is assigned to: among agents advertising the
/// kind whose last heartbeat is within the staleness bound, the one with the
/// fewest outstanding assignments wins; ties break on agent uuid.
#[derive(Clone)]
pub struct CapabilityScheduler {
    db: Db,
    heartbeat_staleness: Duration,
}

impl CapabilityScheduler {
    pub fn new(db: Db, heartbeat_staleness: Duration) -> Self {
        Self {
            db,
            heartbeat_staleness,
        }
    }

    pub async fn place(&self, kind: ResourceKind) -> Result<Option<Uuid>> {
        let stale_after = Utc::now() - self.heartbeat_staleness;
        let agents = persistence::agents::live_agents_with_load(&self.db, stale_after).await?;

        Ok(agents
            .into_iter()
            .find(|agent| {
                agent
                    .capabilities
                    .0
                    .iter()
                    .any(|label| capability_matches(label, kind.as_str()))
            })
            .map(|agent| agent.uuid))
    }
}
