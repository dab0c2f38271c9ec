use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct AgentRecord {
    pub uuid: Uuid,
    pub name: String,
    pub capabilities: Json<Vec<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub uuid: Uuid,
    pub name: String,
    pub capabilities: Vec<String>,
}

/// Register an agent, idempotent on the node uuid. Re-registration refreshes
/// the advertised capability set and the heartbeat.
pub async fn upsert_agent(pool: &Db, new: NewAgent) -> Result<AgentRecord> {
    sqlx::query(
        r#"
        INSERT INTO agents (uuid, name, capabilities, last_heartbeat)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (uuid) DO UPDATE SET
            name = excluded.name,
            capabilities = excluded.capabilities,
            last_heartbeat = excluded.last_heartbeat,
            updated_at = datetime('now')
        "#,
    )
    .bind(new.uuid)
    .bind(&new.name)
    .bind(Json(&new.capabilities))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_agent(pool, new.uuid)
        .await?
        .ok_or_else(|| anyhow::anyhow!("agent upsert did not return row"))
}

pub async fn get_agent(pool: &Db, uuid: Uuid) -> Result<Option<AgentRecord>> {
    let record = sqlx::query_as::<_, AgentRecord>(
        "SELECT uuid, name, capabilities, last_heartbeat, created_at, updated_at FROM agents WHERE uuid = ?1",
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn touch_heartbeat(pool: &Db, uuid: Uuid, at: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents SET last_heartbeat = ?2, updated_at = datetime('now') WHERE uuid = ?1",
    )
    .bind(uuid)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// An agent together with its outstanding assignment load, used by the
/// capability scheduler.
#[derive(Debug, Clone, FromRow)]
pub struct AgentLoadRecord {
    pub uuid: Uuid,
    pub name: String,
    pub capabilities: Json<Vec<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub load: i64,
}

/// Agents whose last heartbeat is within the staleness bound, with their
/// current outstanding target count, least loaded first.
pub async fn live_agents_with_load(
    pool: &Db,
    heartbeat_after: DateTime<Utc>,
) -> Result<Vec<AgentLoadRecord>> {
    let records = sqlx::query_as::<_, AgentLoadRecord>(
        r#"
        SELECT
            a.uuid,
            a.name,
            a.capabilities,
            a.last_heartbeat,
            (
                SELECT COUNT(*) FROM targets t
                WHERE t.agent_id = a.uuid AND t.status IN ('NEW', 'IN_PROGRESS')
            ) AS load
        FROM agents a
        WHERE a.last_heartbeat IS NOT NULL AND a.last_heartbeat >= ?1
        ORDER BY load ASC, a.uuid ASC
        "#,
    )
    .bind(heartbeat_after)
    .fetch_all(pool)
    .await?;
    Ok(records)
}
