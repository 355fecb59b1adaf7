use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Boundary cache: one row per level set
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS boundary_cache (
            level_key TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            digest TEXT NOT NULL,
            collection_json TEXT NOT NULL,
            report_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_boundary_cache_version ON boundary_cache(version)")
        .execute(pool)
        .await?;

    Ok(())
}
