use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::api::{ResourceEnvelope, ResourceKind};
use thiserror::Error;
use uuid::Uuid;

use crate::config;

pub mod certificate;
pub mod compute;
pub mod password;
pub mod service;

/// Typed failure taxonomy of capability drivers. Only `Transient` is retried
/// by the agent; everything else moves the target to ERROR with a durable
/// reason.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transient driver failure: {0}")]
    Transient(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("permanent driver failure: {0}")]
    Permanent(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Transient(format!("io: {err}"))
    }
}

/// Node-local executor for exactly one resource kind.
///
/// Every operation is idempotent on the identifier: a crashed call leaves
/// the node in a state the next iteration can resume from, and `delete`
/// succeeds if the resource is already gone. Implementations must be safe to
/// call concurrently with their own `list_actual`.
#[async_trait]
pub trait CapabilityDriver: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Upper bound for one driver operation; expiry maps to a transient
    /// failure and the next iteration retries.
    fn operation_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }

    /// What exists locally right now.
    async fn list_actual(&self) -> Result<Vec<ResourceEnvelope>, DriverError>;

    async fn create(&self, target: &ResourceEnvelope) -> Result<ResourceEnvelope, DriverError>;

    async fn update(
        &self,
        target: &ResourceEnvelope,
        prior: &ResourceEnvelope,
    ) -> Result<ResourceEnvelope, DriverError>;

    async fn delete(&self, actual: &ResourceEnvelope) -> Result<(), DriverError>;
}

impl std::fmt::Debug for dyn CapabilityDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapabilityDriver({:?})", self.kind())
    }
}

pub type DynCapabilityDriver = Arc<dyn CapabilityDriver>;

/// Closed registry mapping capability labels to driver constructors. New
/// kinds are added by extending this match together with the kind
/// enumeration.
pub fn build_drivers(cfg: &config::AppConfig) -> anyhow::Result<Vec<DynCapabilityDriver>> {
    let work_dir = PathBuf::from(&cfg.universal_agent.work_dir);
    let mut drivers: Vec<DynCapabilityDriver> = Vec::new();

    for label in cfg.universal_agent.driver_list() {
        let driver: DynCapabilityDriver = match label.as_str() {
            "em_core_compute_nodes" => {
                Arc::new(compute::ComputeNodeDriver::new(&work_dir, &cfg.core_driver)?)
            }
            "em_core_service_nodes" => Arc::new(service::ServiceNodeDriver::new(&work_dir)?),
            "password" => Arc::new(password::PasswordDriver::new(&work_dir)?),
            "certificate" => Arc::new(certificate::CertificateDriver::new(&work_dir)?),
            other => anyhow::bail!("unknown capability driver: {other}"),
        };
        drivers.push(driver);
    }

    Ok(drivers)
}

/// JSON-file-backed actual store shared by the drivers; one file per kind
/// under the agent work directory.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<Uuid, ResourceEnvelope>>,
}

impl FileStore {
    pub fn open(work_dir: &Path, file_name: &str) -> Result<Self, DriverError> {
        std::fs::create_dir_all(work_dir)?;
        let path = work_dir.join(file_name);
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|err| DriverError::Permanent(format!("corrupt driver store: {err}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn list(&self) -> Vec<ResourceEnvelope> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, uuid: Uuid) -> Option<ResourceEnvelope> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .get(&uuid)
            .cloned()
    }

    pub fn put(&self, envelope: ResourceEnvelope) -> Result<(), DriverError> {
        let snapshot = {
            let mut entries = self.entries.lock().expect("store lock poisoned");
            entries.insert(envelope.uuid, envelope);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    pub fn remove(&self, uuid: Uuid) -> Result<(), DriverError> {
        let snapshot = {
            let mut entries = self.entries.lock().expect("store lock poisoned");
            entries.remove(&uuid);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, entries: &HashMap<Uuid, ResourceEnvelope>) -> Result<(), DriverError> {
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|err| DriverError::Permanent(format!("serialize driver store: {err}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::api::ResourceStatus;
    use serde_json::json;

    fn envelope(uuid: Uuid) -> ResourceEnvelope {
        ResourceEnvelope {
            uuid,
            kind: ResourceKind::Password,
            project_id: Uuid::new_v4(),
            version: 1,
            status: ResourceStatus::Active,
            spec: json!({"name": "p"}),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path(), "password_state.json").expect("open");
        let uuid = Uuid::new_v4();
        store.put(envelope(uuid)).expect("put");

        let reopened = FileStore::open(dir.path(), "password_state.json").expect("reopen");
        assert!(reopened.get(uuid).is_some());

        reopened.remove(uuid).expect("remove");
        let reopened = FileStore::open(dir.path(), "password_state.json").expect("reopen");
        assert!(reopened.get(uuid).is_none());
    }

    #[test]
    fn registry_rejects_unknown_labels() {
        let mut cfg = crate::test_support::base_config();
        cfg.universal_agent.caps_drivers = "password,flux_capacitor".into();
        let err = build_drivers(&cfg).expect_err("unknown label");
        assert!(err.to_string().contains("flux_capacitor"));
    }

    #[test]
    fn registry_builds_every_known_driver() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = crate::test_support::base_config();
        cfg.universal_agent.work_dir = dir.path().to_string_lossy().into_owned();
        let drivers = build_drivers(&cfg).expect("drivers");
        assert_eq!(drivers.len(), 4);

        let kinds: Vec<_> = drivers.iter().map(|driver| driver.kind()).collect();
        assert!(kinds.contains(&ResourceKind::ComputeNode));
        assert!(kinds.contains(&ResourceKind::ServiceNode));
        assert!(kinds.contains(&ResourceKind::Password));
        assert!(kinds.contains(&ResourceKind::Certificate));
    }
}
