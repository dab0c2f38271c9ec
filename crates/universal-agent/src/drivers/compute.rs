use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use common::api::{NodeSpec, ResourceEnvelope, ResourceKind, ResourceStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CapabilityDriver, DriverError, FileStore};
use crate::config::CoreDriverConfig;

/// A machine allocated from the pool backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    pub uuid: Uuid,
    pub cores: u32,
    pub ram: u64,
    pub image: Option<String>,
}

/// Allocation backend behind the compute driver. The libvirt backend lives
/// out of tree and implements the same contract.
pub trait MachinePoolBackend: Send + Sync {
    fn allocate(&self, node: Uuid, spec: &NodeSpec) -> Result<Machine, DriverError>;
    fn resize(&self, node: Uuid, spec: &NodeSpec) -> Result<Machine, DriverError>;
    fn release(&self, node: Uuid) -> Result<(), DriverError>;
}

/// In-tree dummy backend: tracks allocations in memory with a fixed
/// capacity, enough to exercise the full reconciliation path.
pub struct DummyPoolBackend {
    capacity: u32,
    machines: Mutex<HashMap<Uuid, Machine>>,
}

impl DummyPoolBackend {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            machines: Mutex::new(HashMap::new()),
        }
    }
}

impl MachinePoolBackend for DummyPoolBackend {
    fn allocate(&self, node: Uuid, spec: &NodeSpec) -> Result<Machine, DriverError> {
        let mut machines = self.machines.lock().expect("pool lock poisoned");
        if let Some(existing) = machines.get(&node) {
            return Ok(existing.clone());
        }
        if machines.len() as u32 >= self.capacity {
            return Err(DriverError::Transient("machine pool is exhausted".into()));
        }
        let machine = Machine {
            uuid: Uuid::new_v4(),
            cores: spec.cores,
            ram: spec.ram,
            image: spec.image.clone(),
        };
        machines.insert(node, machine.clone());
        Ok(machine)
    }

    fn resize(&self, node: Uuid, spec: &NodeSpec) -> Result<Machine, DriverError> {
        let mut machines = self.machines.lock().expect("pool lock poisoned");
        let machine = machines
            .get_mut(&node)
            .ok_or_else(|| DriverError::PreconditionFailed("machine is not allocated".into()))?;
        machine.cores = spec.cores;
        machine.ram = spec.ram;
        machine.image = spec.image.clone();
        Ok(machine.clone())
    }

    fn release(&self, node: Uuid) -> Result<(), DriverError> {
        self.machines.lock().expect("pool lock poisoned").remove(&node);
        Ok(())
    }
}

/// Realizes compute-node targets against the machine-pool backend.
pub struct ComputeNodeDriver {
    backend: Box<dyn MachinePoolBackend>,
    store: FileStore,
    pool_name: String,
}

impl ComputeNodeDriver {
    pub fn new(work_dir: &Path, cfg: &CoreDriverConfig) -> Result<Self, DriverError> {
        Ok(Self {
            backend: Box::new(DummyPoolBackend::new(cfg.capacity)),
            store: FileStore::open(work_dir, "compute_cap_storage.json")?,
            pool_name: cfg.pool_name.clone(),
        })
    }

    pub fn with_backend(
        work_dir: &Path,
        backend: Box<dyn MachinePoolBackend>,
        pool_name: &str,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            backend,
            store: FileStore::open(work_dir, "compute_cap_storage.json")?,
            pool_name: pool_name.to_string(),
        })
    }

    fn parse_spec(target: &ResourceEnvelope) -> Result<NodeSpec, DriverError> {
        let spec: NodeSpec = serde_json::from_value(target.spec.clone())
            .map_err(|err| DriverError::InvalidInput(format!("node spec: {err}")))?;
        if spec.cores == 0 || spec.ram == 0 {
            return Err(DriverError::InvalidInput(
                "nodes need at least one core and some ram".into(),
            ));
        }
        Ok(spec)
    }

    fn actual_from(
        &self,
        target: &ResourceEnvelope,
        spec: &NodeSpec,
        machine: &Machine,
    ) -> Result<ResourceEnvelope, DriverError> {
        let mut payload = serde_json::to_value(spec)
            .map_err(|err| DriverError::Permanent(err.to_string()))?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("machine_id".into(), serde_json::json!(machine.uuid));
            map.insert("pool".into(), serde_json::json!(self.pool_name));
        }

        let actual = ResourceEnvelope {
            uuid: target.uuid,
            kind: ResourceKind::ComputeNode,
            project_id: target.project_id,
            version: target.version,
            status: ResourceStatus::Active,
            spec: payload,
            observed_at: Utc::now(),
        };
        self.store.put(actual.clone())?;
        Ok(actual)
    }
}

#[async_trait]
impl CapabilityDriver for ComputeNodeDriver {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ComputeNode
    }

    // Machine allocation can take a boot cycle.
    fn operation_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(120)
    }

    async fn list_actual(&self) -> Result<Vec<ResourceEnvelope>, DriverError> {
        Ok(self.store.list())
    }

    async fn create(&self, target: &ResourceEnvelope) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        let machine = self.backend.allocate(target.uuid, &spec)?;
        self.actual_from(target, &spec, &machine)
    }

    async fn update(
        &self,
        target: &ResourceEnvelope,
        _prior: &ResourceEnvelope,
    ) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        let machine = self.backend.resize(target.uuid, &spec)?;
        self.actual_from(target, &spec, &machine)
    }

    async fn delete(&self, actual: &ResourceEnvelope) -> Result<(), DriverError> {
        self.backend.release(actual.uuid)?;
        self.store.remove(actual.uuid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(cores: u32, ram: u64) -> ResourceEnvelope {
        ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::ComputeNode,
            project_id: Uuid::new_v4(),
            version: 1,
            status: ResourceStatus::InProgress,
            spec: json!({"name": "n1", "cores": cores, "ram": ram}),
            observed_at: Utc::now(),
        }
    }

    fn test_driver(dir: &Path, capacity: u32) -> ComputeNodeDriver {
        ComputeNodeDriver::with_backend(
            dir,
            Box::new(DummyPoolBackend::new(capacity)),
            "default",
        )
        .expect("driver")
    }

    #[tokio::test]
    async fn create_allocates_and_reports_the_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_driver(dir.path(), 4);
        let target = target(1, 1024);

        let actual = driver.create(&target).await.expect("create");
        assert_eq!(actual.status, ResourceStatus::Active);
        assert_eq!(actual.spec["cores"], 1);
        assert_eq!(actual.spec["ram"], 1024);
        assert!(actual.spec["machine_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn create_is_idempotent_per_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_driver(dir.path(), 4);
        let target = target(1, 1024);

        let first = driver.create(&target).await.expect("create");
        let second = driver.create(&target).await.expect("recreate");
        assert_eq!(first.spec["machine_id"], second.spec["machine_id"]);
    }

    #[tokio::test]
    async fn exhausted_pool_is_a_transient_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_driver(dir.path(), 1);

        driver.create(&target(1, 1024)).await.expect("first");
        let err = driver.create(&target(1, 1024)).await.expect_err("full");
        assert!(err.is_transient(), "exhaustion must be retried, not parked");
    }

    #[tokio::test]
    async fn update_resizes_the_allocated_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_driver(dir.path(), 4);
        let mut target = target(1, 1024);

        let prior = driver.create(&target).await.expect("create");
        target.version += 1;
        target.spec = json!({"name": "n1", "cores": 2, "ram": 2048});
        let actual = driver.update(&target, &prior).await.expect("update");
        assert_eq!(actual.spec["cores"], 2);
        assert_eq!(actual.spec["ram"], 2048);
        assert_eq!(actual.spec["machine_id"], prior.spec["machine_id"]);
    }

    #[tokio::test]
    async fn delete_releases_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_driver(dir.path(), 1);

        let first = target(1, 1024);
        let actual = driver.create(&first).await.expect("create");
        driver.delete(&actual).await.expect("delete");
        driver.delete(&actual).await.expect("delete again");

        driver.create(&target(1, 1024)).await.expect("capacity freed");
    }
}
