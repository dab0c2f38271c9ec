use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use common::api::{
    ResourceEnvelope, ResourceKind, ResourceStatus, ServiceHook, ServiceNodeSpec,
};

use super::{CapabilityDriver, DriverError, FileStore};

/// Realizes service-node projections as systemd units under the agent work
/// directory. Unit installation into the running systemd is handled by the
/// host integration; the driver owns the materialized unit files.
pub struct ServiceNodeDriver {
    units_dir: PathBuf,
    store: FileStore,
}

impl ServiceNodeDriver {
    pub fn new(work_dir: &Path) -> Result<Self, DriverError> {
        let units_dir = work_dir.join("units");
        std::fs::create_dir_all(&units_dir)?;
        Ok(Self {
            units_dir,
            store: FileStore::open(work_dir, "service_cap_storage.json")?,
        })
    }

    fn parse_spec(target: &ResourceEnvelope) -> Result<ServiceNodeSpec, DriverError> {
        let spec: ServiceNodeSpec = serde_json::from_value(target.spec.clone())
            .map_err(|err| DriverError::InvalidInput(format!("service node spec: {err}")))?;
        if spec.name.trim().is_empty() || spec.name.contains('/') {
            return Err(DriverError::InvalidInput(
                "service name must be a plain unit name".into(),
            ));
        }
        let has_service_hook = spec
            .before
            .iter()
            .chain(spec.after.iter())
            .any(|hook| matches!(hook, ServiceHook::Service { .. }));
        if has_service_hook {
            return Err(DriverError::InvalidInput(
                "service hooks of kind 'service' are not supported yet".into(),
            ));
        }
        Ok(spec)
    }

    fn materialize(
        &self,
        target: &ResourceEnvelope,
        spec: &ServiceNodeSpec,
    ) -> Result<ResourceEnvelope, DriverError> {
        let unit = render_unit(spec);
        let path = self.units_dir.join(format!("{}.service", spec.name));
        std::fs::write(&path, unit)?;

        let actual = ResourceEnvelope {
            uuid: target.uuid,
            kind: ResourceKind::ServiceNode,
            project_id: target.project_id,
            version: target.version,
            status: ResourceStatus::Active,
            spec: target.spec.clone(),
            observed_at: Utc::now(),
        };
        self.store.put(actual.clone())?;
        Ok(actual)
    }
}

/// Fixed unit template; `before`/`after` shell hooks land as
/// `ExecStartPre`/`ExecStartPost`, oneshot semantics map to `Type=oneshot`.
pub fn render_unit(spec: &ServiceNodeSpec) -> String {
    let mut lines = vec![
        "[Unit]".to_string(),
        format!("Description={}", spec.name),
        String::new(),
        "[Service]".to_string(),
    ];

    if spec.service_type.is_oneshot() {
        lines.push("Type=oneshot".to_string());
    } else {
        lines.push("Type=simple".to_string());
        lines.push("Restart=on-failure".to_string());
    }
    lines.push(format!("User={}", spec.user));
    lines.push(format!("Group={}", spec.group));

    for hook in &spec.before {
        if let ServiceHook::Shell { cmd } = hook {
            lines.push(format!("ExecStartPre={cmd}"));
        }
    }
    lines.push(format!("ExecStart={}", spec.command));
    for hook in &spec.after {
        if let ServiceHook::Shell { cmd } = hook {
            lines.push(format!("ExecStartPost={cmd}"));
        }
    }

    lines.push(String::new());
    lines.push("[Install]".to_string());
    lines.push("WantedBy=multi-user.target".to_string());
    lines.push(String::new());
    lines.join("\n")
}

#[async_trait]
impl CapabilityDriver for ServiceNodeDriver {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServiceNode
    }

    async fn list_actual(&self) -> Result<Vec<ResourceEnvelope>, DriverError> {
        Ok(self.store.list())
    }

    async fn create(&self, target: &ResourceEnvelope) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        self.materialize(target, &spec)
    }

    async fn update(
        &self,
        target: &ResourceEnvelope,
        prior: &ResourceEnvelope,
    ) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        let prior_name = prior
            .spec
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        if !prior_name.is_empty() && prior_name != spec.name {
            let stale = self.units_dir.join(format!("{prior_name}.service"));
            if stale.exists() {
                std::fs::remove_file(stale)?;
            }
        }
        self.materialize(target, &spec)
    }

    async fn delete(&self, actual: &ResourceEnvelope) -> Result<(), DriverError> {
        if let Some(name) = actual.spec.get("name").and_then(|value| value.as_str()) {
            let path = self.units_dir.join(format!("{name}.service"));
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        self.store.remove(actual.uuid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::api::ServiceType;
    use serde_json::json;
    use uuid::Uuid;

    fn projection(service_type: &str, before: serde_json::Value) -> ResourceEnvelope {
        ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::ServiceNode,
            project_id: Uuid::new_v4(),
            version: 1,
            status: ResourceStatus::InProgress,
            spec: json!({
                "service_id": Uuid::new_v4(),
                "node_id": Uuid::new_v4(),
                "name": "web",
                "service_type": service_type,
                "command": "/usr/bin/web",
                "user": "web",
                "group": "web",
                "before": before,
            }),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn unit_template_renders_hooks_and_type() {
        let spec = ServiceNodeSpec {
            service_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            name: "web".into(),
            service_type: ServiceType::MonopolyOneshot,
            command: "/usr/bin/web".into(),
            user: "web".into(),
            group: "web".into(),
            before: vec![ServiceHook::Shell {
                cmd: "/usr/bin/setup".into(),
            }],
            after: vec![ServiceHook::Shell {
                cmd: "/usr/bin/announce".into(),
            }],
        };

        let unit = render_unit(&spec);
        assert!(unit.contains("Type=oneshot"));
        assert!(unit.contains("ExecStartPre=/usr/bin/setup"));
        assert!(unit.contains("ExecStart=/usr/bin/web"));
        assert!(unit.contains("ExecStartPost=/usr/bin/announce"));
        assert!(unit.contains("User=web"));
        assert!(!unit.contains("Restart="), "oneshot units are not restarted");
    }

    #[tokio::test]
    async fn create_writes_the_unit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = ServiceNodeDriver::new(dir.path()).expect("driver");
        let target = projection("simple", json!([{"kind": "shell", "cmd": "/usr/bin/setup"}]));

        let actual = driver.create(&target).await.expect("create");
        assert_eq!(actual.status, ResourceStatus::Active);

        let unit = std::fs::read_to_string(dir.path().join("units/web.service")).expect("unit");
        assert!(unit.contains("Type=simple"));
        assert!(unit.contains("Restart=on-failure"));
    }

    #[tokio::test]
    async fn service_kind_hooks_are_invalid_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = ServiceNodeDriver::new(dir.path()).expect("driver");
        let target = projection("simple", json!([{"kind": "service", "ref": Uuid::new_v4()}]));

        let err = driver.create(&target).await.expect_err("rejected");
        assert!(matches!(err, DriverError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_removes_the_unit_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = ServiceNodeDriver::new(dir.path()).expect("driver");
        let target = projection("oneshot", json!([]));

        let actual = driver.create(&target).await.expect("create");
        driver.delete(&actual).await.expect("delete");
        assert!(!dir.path().join("units/web.service").exists());
        driver.delete(&actual).await.expect("delete again");
    }
}
