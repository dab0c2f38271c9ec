use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::Migrate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub const fn migrator() -> &'static sqlx::migrate::Migrator {
    &MIGRATOR
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub pending: Vec<MigrationLabel>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunOutcome {
    pub snapshot: MigrationSnapshot,
    pub applied: Vec<MigrationLabel>,
}

pub async fn init_pool(database_url: &str, pool_size: u32) -> Result<Db> {
    let is_memory_request = database_url.starts_with("sqlite::memory");
    let resolved_url = if is_memory_request {
        let db_path = std::env::temp_dir().join(format!("genesis-core-test-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", db_path.display())
    } else {
        database_url.to_string()
    };

    ensure_db_dir(&resolved_url)?;

    let mut opts = SqliteConnectOptions::from_str(&resolved_url)?;
    opts = opts.create_if_missing(true).foreign_keys(true);
    if is_memory_request {
        // A pooled in-memory SQLite URL would hand every connection its own
        // private database and make cross-connection queries flaky in tests.
        // Backing the request with a throwaway file keeps one database while
        // still exercising the pool API surface.
        opts = opts.shared_cache(true);
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_opts = if is_memory_request {
        SqlitePoolOptions::new().max_connections(1)
    } else {
        SqlitePoolOptions::new().max_connections(pool_size.max(1))
    };

    let pool = pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    if let Some(path_str) = database_url.strip_prefix("sqlite://") {
        let path = Path::new(path_str);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationRunOutcome> {
    let before = applied_versions(pool).await?;
    MIGRATOR.run(pool).await?;
    let after = applied_versions(pool).await?;

    let descriptions: HashMap<i64, String> = MIGRATOR
        .iter()
        .map(|m| (m.version, m.description.to_string()))
        .collect();

    let applied = after
        .difference(&before)
        .map(|version| MigrationLabel {
            version: *version,
            description: descriptions
                .get(version)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect();

    let pending = MIGRATOR
        .iter()
        .filter(|m| !after.contains(&m.version))
        .map(|m| MigrationLabel {
            version: m.version,
            description: m.description.to_string(),
        })
        .collect();

    Ok(MigrationRunOutcome {
        snapshot: MigrationSnapshot {
            latest_applied: after.iter().max().copied(),
            latest_available: MIGRATOR.iter().map(|m| m.version).max(),
            pending,
        },
        applied,
    })
}

async fn applied_versions(pool: &Db) -> Result<HashSet<i64>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table().await?;
    let applied = conn.list_applied_migrations().await?;
    Ok(applied.into_iter().map(|m| m.version).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_once() {
        let pool = init_pool("sqlite::memory:", 1).await.expect("pool");
        let first = run_migrations(&pool).await.expect("migrations");
        assert!(!first.applied.is_empty());
        assert!(first.snapshot.pending.is_empty());

        let second = run_migrations(&pool).await.expect("rerun");
        assert!(second.applied.is_empty());
        assert_eq!(
            second.snapshot.latest_applied,
            second.snapshot.latest_available
        );
    }
}
