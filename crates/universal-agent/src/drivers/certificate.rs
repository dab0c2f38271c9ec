use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::api::{
    CertificateActual, CertificateSpec, ResourceEnvelope, ResourceKind, ResourceStatus,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{CapabilityDriver, DriverError, FileStore};

/// Issues certificate bundles into the agent work directory. The issuing
/// backend is a self-contained placeholder; a real CA integration sits
/// behind the same driver contract.
pub struct CertificateDriver {
    bundles_dir: PathBuf,
    store: FileStore,
}

impl CertificateDriver {
    pub fn new(work_dir: &Path) -> Result<Self, DriverError> {
        let bundles_dir = work_dir.join("certificates");
        std::fs::create_dir_all(&bundles_dir)?;
        Ok(Self {
            bundles_dir,
            store: FileStore::open(work_dir, "certificate_cap_storage.json")?,
        })
    }

    fn parse_spec(target: &ResourceEnvelope) -> Result<CertificateSpec, DriverError> {
        let spec: CertificateSpec = serde_json::from_value(target.spec.clone())
            .map_err(|err| DriverError::InvalidInput(format!("certificate spec: {err}")))?;
        if spec.common_name.trim().is_empty() {
            return Err(DriverError::InvalidInput("common_name cannot be empty".into()));
        }
        if spec.expire_days == 0 {
            return Err(DriverError::InvalidInput("expire_days must be > 0".into()));
        }
        Ok(spec)
    }

    fn issue(
        &self,
        target: &ResourceEnvelope,
        spec: &CertificateSpec,
    ) -> Result<ResourceEnvelope, DriverError> {
        let mut key_material = [0u8; 64];
        rand::rng().fill_bytes(&mut key_material);

        let mut hasher = Sha256::new();
        hasher.update(spec.common_name.as_bytes());
        hasher.update(key_material);
        let fingerprint = hex::encode(hasher.finalize());

        let not_after = Utc::now() + Duration::days(spec.expire_days as i64);
        let bundle = serde_json::json!({
            "common_name": spec.common_name,
            "dns_names": spec.dns_names,
            "fingerprint": fingerprint,
            "not_after": not_after,
        });
        let path = self.bundles_dir.join(format!("{}.json", target.uuid));
        std::fs::write(&path, bundle.to_string())?;

        let actual = ResourceEnvelope {
            uuid: target.uuid,
            kind: ResourceKind::Certificate,
            project_id: target.project_id,
            version: target.version,
            status: ResourceStatus::Active,
            spec: serde_json::to_value(CertificateActual {
                common_name: spec.common_name.clone(),
                not_after,
                fingerprint,
            })
            .map_err(|err| DriverError::Permanent(err.to_string()))?,
            observed_at: Utc::now(),
        };
        self.store.put(actual.clone())?;
        Ok(actual)
    }
}

#[async_trait]
impl CapabilityDriver for CertificateDriver {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Certificate
    }

    async fn list_actual(&self) -> Result<Vec<ResourceEnvelope>, DriverError> {
        Ok(self.store.list())
    }

    async fn create(&self, target: &ResourceEnvelope) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        if let Some(existing) = self.store.get(target.uuid) {
            let bundle = self.bundles_dir.join(format!("{}.json", target.uuid));
            if bundle.exists() {
                let mut refreshed = existing;
                refreshed.version = target.version;
                refreshed.observed_at = Utc::now();
                self.store.put(refreshed.clone())?;
                return Ok(refreshed);
            }
        }
        self.issue(target, &spec)
    }

    async fn update(
        &self,
        target: &ResourceEnvelope,
        _prior: &ResourceEnvelope,
    ) -> Result<ResourceEnvelope, DriverError> {
        // Re-issue under the new spec; the bundle file is keyed on the
        // identifier, so the replacement is atomic from the consumer's view.
        let spec = Self::parse_spec(target)?;
        self.issue(target, &spec)
    }

    async fn delete(&self, actual: &ResourceEnvelope) -> Result<(), DriverError> {
        let path = self.bundles_dir.join(format!("{}.json", actual.uuid));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.store.remove(actual.uuid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn target(common_name: &str) -> ResourceEnvelope {
        ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::Certificate,
            project_id: Uuid::new_v4(),
            version: 1,
            status: ResourceStatus::InProgress,
            spec: json!({"common_name": common_name, "dns_names": ["alt.example.test"]}),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn issue_reports_expiry_and_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CertificateDriver::new(dir.path()).expect("driver");
        let target = target("api.example.test");

        let actual = driver.create(&target).await.expect("create");
        assert_eq!(actual.status, ResourceStatus::Active);
        assert_eq!(actual.spec["common_name"], "api.example.test");
        assert_eq!(actual.spec["fingerprint"].as_str().unwrap().len(), 64);

        let not_after: chrono::DateTime<Utc> =
            serde_json::from_value(actual.spec["not_after"].clone()).expect("timestamp");
        assert!(not_after > Utc::now() + Duration::days(89));
    }

    #[tokio::test]
    async fn replayed_create_keeps_the_issued_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CertificateDriver::new(dir.path()).expect("driver");
        let target = target("api.example.test");

        let first = driver.create(&target).await.expect("create");
        let second = driver.create(&target).await.expect("recreate");
        assert_eq!(first.spec["fingerprint"], second.spec["fingerprint"]);
    }

    #[tokio::test]
    async fn update_reissues_the_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CertificateDriver::new(dir.path()).expect("driver");
        let mut target = target("api.example.test");

        let first = driver.create(&target).await.expect("create");
        target.version += 1;
        let second = driver.update(&target, &first).await.expect("update");
        assert_ne!(first.spec["fingerprint"], second.spec["fingerprint"]);
        assert_eq!(second.version, target.version);
    }

    #[tokio::test]
    async fn empty_common_name_is_invalid_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CertificateDriver::new(dir.path()).expect("driver");
        let err = driver.create(&target("  ")).await.expect_err("rejected");
        assert!(matches!(err, DriverError::InvalidInput(_)));
    }
}
