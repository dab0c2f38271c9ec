use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use common::api::{ResourceEnvelope, ResourceKind, ResourceStatus};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use uuid::Uuid;

use super::Db;
use crate::Result;

const TARGET_COLUMNS: &str = r#"
    uuid,
    kind,
    project_id,
    version,
    status,
    spec,
    parent_id,
    agent_id,
    attempts,
    lease_until,
    status_reason,
    created_at,
    updated_at
"#;

/// One row of the target (desired) plane.
#[derive(Debug, Clone, FromRow)]
pub struct TargetRecord {
    pub uuid: Uuid,
    pub kind: String,
    pub project_id: Uuid,
    pub version: i64,
    pub status: String,
    pub spec: Json<Value>,
    pub parent_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub attempts: i64,
    pub lease_until: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TargetRecord {
    pub fn kind(&self) -> Result<ResourceKind> {
        ResourceKind::parse(&self.kind)
            .with_context(|| format!("unknown resource kind in database: {}", self.kind))
    }

    pub fn status(&self) -> Result<ResourceStatus> {
        parse_status(&self.status)
    }

    pub fn envelope(&self) -> Result<ResourceEnvelope> {
        Ok(ResourceEnvelope {
            uuid: self.uuid,
            kind: self.kind()?,
            project_id: self.project_id,
            version: self.version,
            status: self.status()?,
            spec: self.spec.0.clone(),
            observed_at: self.updated_at,
        })
    }
}

/// One row of the actual (observed) plane.
#[derive(Debug, Clone, FromRow)]
pub struct ActualRecord {
    pub uuid: Uuid,
    pub kind: String,
    pub project_id: Uuid,
    pub version: i64,
    pub status: String,
    pub spec: Json<Value>,
    pub agent_id: Uuid,
    pub observed_at: DateTime<Utc>,
}

impl ActualRecord {
    pub fn status(&self) -> Result<ResourceStatus> {
        parse_status(&self.status)
    }
}

fn parse_status(value: &str) -> Result<ResourceStatus> {
    match value {
        "NEW" => Ok(ResourceStatus::New),
        "IN_PROGRESS" => Ok(ResourceStatus::InProgress),
        "ACTIVE" => Ok(ResourceStatus::Active),
        "ERROR" => Ok(ResourceStatus::Error),
        "DELETING" => Ok(ResourceStatus::Deleting),
        other => anyhow::bail!("unknown resource status in database: {other}"),
    }
}

#[derive(Debug, Clone)]
pub struct NewTarget {
    pub uuid: Uuid,
    pub kind: ResourceKind,
    pub project_id: Uuid,
    pub spec: Value,
    pub parent_id: Option<Uuid>,
}

impl NewTarget {
    pub fn new(kind: ResourceKind, project_id: Uuid, spec: Value) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind,
            project_id,
            spec,
            parent_id: None,
        }
    }
}

pub async fn create_target(pool: &Db, new: NewTarget) -> Result<TargetRecord> {
    let mut tx = pool.begin().await?;
    let record = create_target_tx(&mut tx, new).await?;
    tx.commit().await?;
    Ok(record)
}

/// Insert a target inside an existing transaction so callers can bundle the
/// write with its IAM check or sibling inserts.
pub async fn create_target_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: NewTarget,
) -> Result<TargetRecord> {
    sqlx::query(
        r#"
        INSERT INTO targets (uuid, kind, project_id, version, status, spec, parent_id)
        VALUES (?1, ?2, ?3, 1, 'NEW', ?4, ?5)
        "#,
    )
    .bind(new.uuid)
    .bind(new.kind.as_str())
    .bind(new.project_id)
    .bind(Json(&new.spec))
    .bind(new.parent_id)
    .execute(&mut **tx)
    .await?;

    let record = sqlx::query_as::<_, TargetRecord>(&format!(
        "SELECT {TARGET_COLUMNS} FROM targets WHERE uuid = ?1"
    ))
    .bind(new.uuid)
    .fetch_one(&mut **tx)
    .await?;
    Ok(record)
}

pub async fn get_target(pool: &Db, uuid: Uuid) -> Result<Option<TargetRecord>> {
    let record = sqlx::query_as::<_, TargetRecord>(&format!(
        "SELECT {TARGET_COLUMNS} FROM targets WHERE uuid = ?1"
    ))
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_targets(
    pool: &Db,
    project_id: Option<Uuid>,
    kind: Option<ResourceKind>,
) -> Result<Vec<TargetRecord>> {
    let mut qb =
        QueryBuilder::<sqlx::Sqlite>::new(format!("SELECT {TARGET_COLUMNS} FROM targets WHERE 1=1"));
    if let Some(project_id) = project_id {
        qb.push(" AND project_id = ");
        qb.push_bind(project_id);
    }
    if let Some(kind) = kind {
        qb.push(" AND kind = ");
        qb.push_bind(kind.as_str());
    }
    qb.push(" ORDER BY created_at ASC, uuid ASC");

    let records = qb.build_query_as::<TargetRecord>().fetch_all(pool).await?;
    Ok(records)
}

/// Compare-and-set update of a target's spec keyed on (uuid, version).
///
/// Returns the number of rows updated; zero means the caller observed a stale
/// version (or the row is gone) and must surface a conflict.
pub async fn cas_update_spec(
    pool: &Db,
    uuid: Uuid,
    expected_version: i64,
    spec: &Value,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET spec = ?3,
            version = version + 1,
            status = 'NEW',
            lease_until = NULL,
            attempts = 0,
            status_reason = NULL,
            updated_at = datetime('now')
        WHERE uuid = ?1 AND version = ?2 AND status != 'DELETING'
        "#,
    )
    .bind(uuid)
    .bind(expected_version)
    .bind(Json(spec))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Mark a target DELETING. Idempotent; DELETING is terminal.
pub async fn mark_deleting(pool: &Db, uuid: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET status = 'DELETING',
            version = version + 1,
            lease_until = NULL,
            updated_at = datetime('now')
        WHERE uuid = ?1 AND status != 'DELETING'
        "#,
    )
    .bind(uuid)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Claim a batch of due targets for one worker pass.
///
/// A fresh claim moves NEW to IN_PROGRESS with an atomic version bump and
/// takes a lease; leased rows are invisible to peer workers until the lease
/// expires. Re-claims of rows already IN_PROGRESS or DELETING refresh the
/// lease without bumping, so an actual converged against the assigned
/// version stays comparable. Oldest rows first, ties broken by uuid.
pub async fn claim_due(
    pool: &Db,
    kinds: &[ResourceKind],
    now: DateTime<Utc>,
    lease: Duration,
    limit: i64,
) -> Result<Vec<TargetRecord>> {
    if kinds.is_empty() {
        return Ok(Vec::new());
    }

    let lease_until = now + lease;
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(
        r#"
        UPDATE targets
        SET version = CASE WHEN status = 'NEW' THEN version + 1 ELSE version END,
            status = CASE WHEN status = 'NEW' THEN 'IN_PROGRESS' ELSE status END,
            lease_until =
        "#,
    );
    qb.push_bind(lease_until);
    qb.push(", updated_at = datetime('now') WHERE uuid IN (SELECT uuid FROM targets WHERE kind IN (");
    {
        let mut separated = qb.separated(", ");
        for kind in kinds {
            separated.push_bind(kind.as_str());
        }
    }
    qb.push(") AND status IN ('NEW', 'IN_PROGRESS', 'DELETING') AND (lease_until IS NULL OR lease_until <= ");
    qb.push_bind(now);
    qb.push(") ORDER BY created_at ASC, uuid ASC LIMIT ");
    qb.push_bind(limit);
    qb.push(") RETURNING ");
    qb.push(TARGET_COLUMNS);

    let records = qb.build_query_as::<TargetRecord>().fetch_all(pool).await?;
    Ok(records)
}

/// Put a claimed target back to NEW with a deferred retry window.
pub async fn defer_target(
    pool: &Db,
    uuid: Uuid,
    retry_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET status = 'NEW',
            version = version + 1,
            attempts = attempts + 1,
            lease_until = ?2,
            updated_at = datetime('now')
        WHERE uuid = ?1 AND status = 'IN_PROGRESS'
        "#,
    )
    .bind(uuid)
    .bind(retry_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn assign_agent(pool: &Db, uuid: Uuid, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET agent_id = ?2,
            version = version + 1,
            updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(agent_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Flip an IN_PROGRESS target to ACTIVE. DELETING and ERROR rows are left
/// alone, so a deletion or permanent failure racing the transition wins.
pub async fn activate_target(pool: &Db, uuid: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET status = 'ACTIVE',
            status_reason = NULL,
            version = version + 1,
            updated_at = datetime('now')
        WHERE uuid = ?1 AND status = 'IN_PROGRESS'
        "#,
    )
    .bind(uuid)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Park a target in ERROR with a durable reason. DELETING stays terminal.
pub async fn fail_target(pool: &Db, uuid: Uuid, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE targets
        SET status = 'ERROR',
            status_reason = ?2,
            version = version + 1,
            updated_at = datetime('now')
        WHERE uuid = ?1 AND status != 'DELETING'
        "#,
    )
    .bind(uuid)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn children_of(pool: &Db, parent_id: Uuid) -> Result<Vec<TargetRecord>> {
    let records = sqlx::query_as::<_, TargetRecord>(&format!(
        "SELECT {TARGET_COLUMNS} FROM targets WHERE parent_id = ?1 ORDER BY uuid ASC"
    ))
    .bind(parent_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Physically remove a target/actual pair. Terminal step of DELETING.
pub async fn remove_pair(pool: &Db, uuid: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM actuals WHERE uuid = ?1")
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM targets WHERE uuid = ?1")
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Targets assigned to one agent for one kind, as sent to the agent.
pub async fn assigned_targets(
    pool: &Db,
    agent_id: Uuid,
    kind: ResourceKind,
) -> Result<Vec<TargetRecord>> {
    let records = sqlx::query_as::<_, TargetRecord>(&format!(
        r#"
        SELECT {TARGET_COLUMNS} FROM targets
        WHERE agent_id = ?1 AND kind = ?2 AND status IN ('IN_PROGRESS', 'ACTIVE')
        ORDER BY created_at ASC, uuid ASC
        "#
    ))
    .bind(agent_id)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn get_actual(pool: &Db, uuid: Uuid) -> Result<Option<ActualRecord>> {
    let record = sqlx::query_as::<_, ActualRecord>(
        r#"
        SELECT uuid, kind, project_id, version, status, spec, agent_id, observed_at
        FROM actuals
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Replace the actual set for one (agent, kind) with the reported set.
///
/// The report is authoritative: actuals the agent stopped reporting are
/// dropped from the actual plane in the same transaction.
pub async fn replace_actual_set(
    pool: &Db,
    agent_id: Uuid,
    kind: ResourceKind,
    actuals: &[ResourceEnvelope],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM actuals WHERE agent_id = ?1 AND kind = ?2")
        .bind(agent_id)
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await?;

    for actual in actuals {
        sqlx::query(
            r#"
            INSERT INTO actuals (uuid, kind, project_id, version, status, spec, agent_id, observed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (uuid) DO UPDATE SET
                version = excluded.version,
                status = excluded.status,
                spec = excluded.spec,
                agent_id = excluded.agent_id,
                observed_at = excluded.observed_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(actual.uuid)
        .bind(actual.kind.as_str())
        .bind(actual.project_id)
        .bind(actual.version)
        .bind(actual.status.as_str())
        .bind(Json(&actual.spec))
        .bind(agent_id)
        .bind(actual.observed_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Actuals whose target is gone: garbage scheduled for removal by the sweep.
pub async fn orphan_actuals(pool: &Db) -> Result<Vec<ActualRecord>> {
    let records = sqlx::query_as::<_, ActualRecord>(
        r#"
        SELECT a.uuid, a.kind, a.project_id, a.version, a.status, a.spec, a.agent_id, a.observed_at
        FROM actuals a
        LEFT JOIN targets t ON t.uuid = a.uuid
        WHERE t.uuid IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_actual(pool: &Db, uuid: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM actuals WHERE uuid = ?1")
        .bind(uuid)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use common::api::ResourceKind;
    use serde_json::json;

    async fn test_pool() -> Db {
        let pool = migrations::init_pool("sqlite::memory:", 1).await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn create_starts_new_at_version_one() {
        let pool = test_pool().await;
        let record = create_target(
            &pool,
            NewTarget::new(ResourceKind::ComputeNode, Uuid::new_v4(), json!({"name": "n1"})),
        )
        .await
        .expect("create");

        assert_eq!(record.version, 1);
        assert_eq!(record.status, "NEW");
        assert!(record.agent_id.is_none());
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let pool = test_pool().await;
        let record = create_target(
            &pool,
            NewTarget::new(ResourceKind::ComputeNode, Uuid::new_v4(), json!({"name": "n1"})),
        )
        .await
        .expect("create");

        let updated = cas_update_spec(&pool, record.uuid, record.version, &json!({"name": "n2"}))
            .await
            .expect("cas");
        assert_eq!(updated, 1);

        // Same starting version again: the second writer loses.
        let stale = cas_update_spec(&pool, record.uuid, record.version, &json!({"name": "n3"}))
            .await
            .expect("cas");
        assert_eq!(stale, 0);

        let current = get_target(&pool, record.uuid).await.expect("get").expect("row");
        assert_eq!(current.version, record.version + 1);
        assert_eq!(current.spec.0["name"], "n2");
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expiry() {
        let pool = test_pool().await;
        let record = create_target(
            &pool,
            NewTarget::new(ResourceKind::Password, Uuid::new_v4(), json!({"name": "p1"})),
        )
        .await
        .expect("create");

        let now = Utc::now();
        let claimed = claim_due(&pool, &[ResourceKind::Password], now, Duration::seconds(30), 10)
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].uuid, record.uuid);
        assert_eq!(claimed[0].status, "IN_PROGRESS");
        assert_eq!(claimed[0].version, record.version + 1);

        // Within the lease window the row is invisible to peers.
        let reclaim = claim_due(&pool, &[ResourceKind::Password], now, Duration::seconds(30), 10)
            .await
            .expect("reclaim");
        assert!(reclaim.is_empty());

        // After lease expiry the row is claimable again.
        let later = now + Duration::seconds(60);
        let reclaim = claim_due(&pool, &[ResourceKind::Password], later, Duration::seconds(30), 10)
            .await
            .expect("late reclaim");
        assert_eq!(reclaim.len(), 1);
    }

    #[tokio::test]
    async fn claims_are_oldest_first_with_uuid_ties() {
        let pool = test_pool().await;
        let project = Uuid::new_v4();
        for name in ["a", "b", "c"] {
            create_target(
                &pool,
                NewTarget::new(ResourceKind::Password, project, json!({"name": name})),
            )
            .await
            .expect("create");
        }

        let claimed = claim_due(
            &pool,
            &[ResourceKind::Password],
            Utc::now(),
            Duration::seconds(30),
            2,
        )
        .await
        .expect("claim");
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn status_report_replaces_actual_set() {
        let pool = test_pool().await;
        let agent = Uuid::new_v4();
        let project = Uuid::new_v4();
        let make = |uuid: Uuid| ResourceEnvelope {
            uuid,
            kind: ResourceKind::Password,
            project_id: project,
            version: 1,
            status: common::api::ResourceStatus::Active,
            spec: json!({"name": "p"}),
            observed_at: Utc::now(),
        };

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        replace_actual_set(&pool, agent, ResourceKind::Password, &[make(first), make(second)])
            .await
            .expect("replace");
        assert!(get_actual(&pool, first).await.expect("get").is_some());

        replace_actual_set(&pool, agent, ResourceKind::Password, &[make(second)])
            .await
            .expect("replace again");
        assert!(get_actual(&pool, first).await.expect("get").is_none());
        assert!(get_actual(&pool, second).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn orphan_actuals_are_reported() {
        let pool = test_pool().await;
        let agent = Uuid::new_v4();
        let orphan = ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::Password,
            project_id: Uuid::new_v4(),
            version: 1,
            status: common::api::ResourceStatus::Active,
            spec: json!({}),
            observed_at: Utc::now(),
        };
        replace_actual_set(&pool, agent, ResourceKind::Password, &[orphan.clone()])
            .await
            .expect("replace");

        let orphans = orphan_actuals(&pool).await.expect("orphans");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].uuid, orphan.uuid);
    }
}
