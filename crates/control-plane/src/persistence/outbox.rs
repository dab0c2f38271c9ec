use chrono::{DateTime, Utc};
use common::api::EventKind;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    Delivered,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "QUEUED",
            OutboxStatus::Delivered => "DELIVERED",
            OutboxStatus::Dead => "DEAD",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRecord {
    pub uuid: Uuid,
    pub kind: String,
    pub payload_version: i64,
    pub payload: Json<Value>,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.kind)
    }
}

/// Commit an event inside the transaction that mutates the producing
/// resource; the outbox makes delivery at-least-once across crashes.
pub async fn enqueue_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    kind: EventKind,
    payload_version: i64,
    payload: &Value,
) -> Result<Uuid> {
    let uuid = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO outbox_events (uuid, kind, payload_version, payload, next_attempt_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(uuid)
    .bind(kind.as_str())
    .bind(payload_version)
    .bind(Json(payload))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(uuid)
}

pub async fn enqueue(pool: &Db, kind: EventKind, payload_version: i64, payload: &Value) -> Result<Uuid> {
    let mut tx = pool.begin().await?;
    let uuid = enqueue_tx(&mut tx, kind, payload_version, payload).await?;
    tx.commit().await?;
    Ok(uuid)
}

pub async fn due_events(pool: &Db, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxRecord>> {
    let records = sqlx::query_as::<_, OutboxRecord>(
        r#"
        SELECT uuid, kind, payload_version, payload, status, attempts, next_attempt_at, last_error
        FROM outbox_events
        WHERE status = 'QUEUED' AND next_attempt_at <= ?1
        ORDER BY created_at ASC
        LIMIT ?2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn mark_delivered(pool: &Db, uuid: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_events SET status = 'DELIVERED', updated_at = datetime('now') WHERE uuid = ?1",
    )
    .bind(uuid)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Record a failed delivery attempt; the event is dead-lettered once the
/// bounded attempt count is exhausted.
pub async fn record_failure(
    pool: &Db,
    uuid: Uuid,
    error: &str,
    next_attempt_at: DateTime<Utc>,
    dead: bool,
) -> Result<u64> {
    let status = if dead {
        OutboxStatus::Dead
    } else {
        OutboxStatus::Queued
    };
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET attempts = attempts + 1,
            last_error = ?2,
            next_attempt_at = ?3,
            status = ?4,
            updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(error)
    .bind(next_attempt_at)
    .bind(status.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn get_event(pool: &Db, uuid: Uuid) -> Result<Option<OutboxRecord>> {
    let record = sqlx::query_as::<_, OutboxRecord>(
        r#"
        SELECT uuid, kind, payload_version, payload, status, attempts, next_attempt_at, last_error
        FROM outbox_events
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}
