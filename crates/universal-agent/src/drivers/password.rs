use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use common::api::{PasswordActual, PasswordSpec, ResourceEnvelope, ResourceKind, ResourceStatus};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::{CapabilityDriver, DriverError, FileStore};

const MAX_PASSWORD_LENGTH: usize = 256;

/// Materializes generated passwords as files under the agent work directory
/// and reports checksums, never the secret material, as the actual.
pub struct PasswordDriver {
    secrets_dir: PathBuf,
    store: FileStore,
}

impl PasswordDriver {
    pub fn new(work_dir: &Path) -> Result<Self, DriverError> {
        let secrets_dir = work_dir.join("passwords");
        std::fs::create_dir_all(&secrets_dir)?;
        Ok(Self {
            secrets_dir,
            store: FileStore::open(work_dir, "password_cap_storage.json")?,
        })
    }

    fn parse_spec(target: &ResourceEnvelope) -> Result<PasswordSpec, DriverError> {
        let spec: PasswordSpec = serde_json::from_value(target.spec.clone())
            .map_err(|err| DriverError::InvalidInput(format!("password spec: {err}")))?;
        if spec.name.trim().is_empty() || spec.name.contains('/') {
            return Err(DriverError::InvalidInput(
                "password name must be a plain file name".into(),
            ));
        }
        if spec.length == 0 || spec.length > MAX_PASSWORD_LENGTH {
            return Err(DriverError::InvalidInput(format!(
                "password length must be within 1..={MAX_PASSWORD_LENGTH}"
            )));
        }
        Ok(spec)
    }

    fn materialize(&self, target: &ResourceEnvelope, spec: &PasswordSpec) -> Result<ResourceEnvelope, DriverError> {
        let secret: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(spec.length)
            .map(char::from)
            .collect();
        let path = self.secrets_dir.join(&spec.name);
        std::fs::write(&path, &secret)?;

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let checksum = hex::encode(hasher.finalize());

        let actual = ResourceEnvelope {
            uuid: target.uuid,
            kind: ResourceKind::Password,
            project_id: target.project_id,
            version: target.version,
            status: ResourceStatus::Active,
            spec: serde_json::to_value(PasswordActual {
                name: spec.name.clone(),
                checksum,
            })
            .map_err(|err| DriverError::Permanent(err.to_string()))?,
            observed_at: Utc::now(),
        };
        self.store.put(actual.clone())?;
        Ok(actual)
    }
}

#[async_trait]
impl CapabilityDriver for PasswordDriver {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Password
    }

    async fn list_actual(&self) -> Result<Vec<ResourceEnvelope>, DriverError> {
        Ok(self.store.list())
    }

    async fn create(&self, target: &ResourceEnvelope) -> Result<ResourceEnvelope, DriverError> {
        let spec = Self::parse_spec(target)?;
        // Idempotent on identifier: a password that already exists for this
        // uuid is reported as-is instead of being rotated.
        if let Some(existing) = self.store.get(target.uuid) {
            if self.secrets_dir.join(&spec.name).exists() {
                let mut refreshed = existing;
                refreshed.version = target.version;
                refreshed.observed_at = Utc::now();
                self.store.put(refreshed.clone())?;
                return Ok(refreshed);
            }
        }
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
        if prior_name != spec.name {
            let stale = self.secrets_dir.join(prior_name);
            if prior_name.is_empty() || stale.exists() {
                let _ = std::fs::remove_file(stale);
            }
        }
        self.materialize(target, &spec)
    }

    async fn delete(&self, actual: &ResourceEnvelope) -> Result<(), DriverError> {
        if let Some(name) = actual.spec.get("name").and_then(|value| value.as_str()) {
            let path = self.secrets_dir.join(name);
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
    use serde_json::json;
    use uuid::Uuid;

    fn target(length: usize) -> ResourceEnvelope {
        ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::Password,
            project_id: Uuid::new_v4(),
            version: 2,
            status: ResourceStatus::InProgress,
            spec: json!({"name": "db-root", "length": length}),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_writes_the_secret_and_reports_a_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = PasswordDriver::new(dir.path()).expect("driver");
        let target = target(24);

        let actual = driver.create(&target).await.expect("create");
        assert_eq!(actual.uuid, target.uuid);
        assert_eq!(actual.version, target.version);
        assert_eq!(actual.status, ResourceStatus::Active);

        let secret = std::fs::read_to_string(dir.path().join("passwords/db-root")).expect("file");
        assert_eq!(secret.len(), 24);
        assert!(
            actual.spec["checksum"].as_str().unwrap().len() == 64,
            "sha256 hex checksum"
        );
        assert!(actual.spec.get("secret").is_none(), "material never leaves the node");
    }

    #[tokio::test]
    async fn create_is_idempotent_on_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = PasswordDriver::new(dir.path()).expect("driver");
        let target = target(24);

        let first = driver.create(&target).await.expect("create");
        let second = driver.create(&target).await.expect("recreate");
        assert_eq!(
            first.spec["checksum"], second.spec["checksum"],
            "replayed create must not rotate the secret"
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = PasswordDriver::new(dir.path()).expect("driver");
        let target = target(24);

        let actual = driver.create(&target).await.expect("create");
        driver.delete(&actual).await.expect("delete");
        assert!(!dir.path().join("passwords/db-root").exists());
        driver.delete(&actual).await.expect("delete again");
        assert!(driver.list_actual().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn invalid_lengths_are_rejected_as_input_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = PasswordDriver::new(dir.path()).expect("driver");

        let err = driver.create(&target(0)).await.expect_err("rejected");
        assert!(matches!(err, DriverError::InvalidInput(_)));
        assert!(!err.is_transient());
    }
}
