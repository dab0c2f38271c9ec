use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub uuid: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub uuid: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub secret_hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PermissionRecord {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct RoleRecord {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewPermissionBinding {
    pub uuid: Uuid,
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewRoleBinding {
    pub uuid: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRecord {
    pub uuid: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_user(pool: &Db, new: NewUser) -> Result<UserRecord> {
    let mut tx = pool.begin().await?;
    create_user_tx(&mut tx, &new).await?;
    tx.commit().await?;

    get_user(pool, new.uuid)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user insert did not return row"))
}

/// Insert a user inside an existing transaction so registration events can
/// be committed together with the row.
pub async fn create_user_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewUser,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO iam_users (uuid, name, email, secret_hash)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(new.uuid)
    .bind(&new.name)
    .bind(&new.email)
    .bind(&new.secret_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_user(pool: &Db, uuid: Uuid) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(
        "SELECT uuid, name, email, secret_hash, created_at, updated_at FROM iam_users WHERE uuid = ?1",
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_user_by_name(pool: &Db, name: &str) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(
        "SELECT uuid, name, email, secret_hash, created_at, updated_at FROM iam_users WHERE name = ?1 COLLATE NOCASE",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_users(pool: &Db) -> Result<Vec<UserRecord>> {
    let records = sqlx::query_as::<_, UserRecord>(
        "SELECT uuid, name, email, secret_hash, created_at, updated_at FROM iam_users ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn create_permission(pool: &Db, uuid: Uuid, name: &str) -> Result<PermissionRecord> {
    sqlx::query("INSERT INTO iam_permissions (uuid, name) VALUES (?1, ?2)")
        .bind(uuid)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(PermissionRecord {
        uuid,
        name: name.to_string(),
    })
}

pub async fn get_permission_by_name(pool: &Db, name: &str) -> Result<Option<PermissionRecord>> {
    let record =
        sqlx::query_as::<_, PermissionRecord>("SELECT uuid, name FROM iam_permissions WHERE name = ?1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(record)
}

pub async fn create_role(pool: &Db, uuid: Uuid, name: &str) -> Result<RoleRecord> {
    sqlx::query("INSERT INTO iam_roles (uuid, name) VALUES (?1, ?2)")
        .bind(uuid)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(RoleRecord {
        uuid,
        name: name.to_string(),
    })
}

pub async fn get_role_by_name(pool: &Db, name: &str) -> Result<Option<RoleRecord>> {
    let record = sqlx::query_as::<_, RoleRecord>("SELECT uuid, name FROM iam_roles WHERE name = ?1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn create_permission_binding(pool: &Db, new: NewPermissionBinding) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO iam_permission_bindings (uuid, role_id, permission_id, project_id)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(new.uuid)
    .bind(new.role_id)
    .bind(new.permission_id)
    .bind(new.project_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_role_binding(pool: &Db, new: NewRoleBinding) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO iam_role_bindings (uuid, user_id, role_id, project_id)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(new.uuid)
    .bind(new.user_id)
    .bind(new.role_id)
    .bind(new.project_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_role_binding(pool: &Db, user_id: Uuid, role_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM iam_role_bindings WHERE user_id = ?1 AND role_id = ?2")
        .bind(user_id)
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Permission names reachable from a subject through the
/// RoleBinding → PermissionBinding chain, scoped to one project.
///
/// Unscoped bindings (NULL project) apply everywhere; project-scoped bindings
/// only inside their project. Wildcard matching happens in the kernel, not
/// here.
const PERMISSION_NAMES_SQL: &str = r#"
    SELECT DISTINCT p.name
    FROM iam_role_bindings rb
    JOIN iam_permission_bindings pb ON pb.role_id = rb.role_id
    JOIN iam_permissions p ON p.uuid = pb.permission_id
    WHERE rb.user_id = ?1
      AND (rb.project_id IS NULL OR rb.project_id = ?2)
      AND (pb.project_id IS NULL OR pb.project_id = ?2)
"#;

pub async fn resolve_permission_names(
    pool: &Db,
    user_id: Uuid,
    project_id: Uuid,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(PERMISSION_NAMES_SQL)
        .bind(user_id)
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(names)
}

/// Same resolution, but inside the transaction that carries the guarded
/// mutation, so a concurrently revoked role cannot slip through.
pub async fn resolve_permission_names_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: Uuid,
    project_id: Uuid,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(PERMISSION_NAMES_SQL)
        .bind(user_id)
        .bind(project_id)
        .fetch_all(&mut **tx)
        .await?;
    Ok(names)
}

pub async fn issue_token(
    pool: &Db,
    user_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO iam_tokens (uuid, user_id, token_hash, expires_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(token_hash)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn resolve_token(pool: &Db, token_hash: &str) -> Result<Option<TokenRecord>> {
    let record = sqlx::query_as::<_, TokenRecord>(
        "SELECT uuid, user_id, token_hash, expires_at FROM iam_tokens WHERE token_hash = ?1",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn set_user_secret(pool: &Db, user_id: Uuid, secret_hash: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE iam_users SET secret_hash = ?2, updated_at = datetime('now') WHERE uuid = ?1",
    )
    .bind(user_id)
    .bind(secret_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
