//! SQLite-backed [`BoundaryStore`] implementation.
//!
//! One row per level set in `boundary_cache`; the collection and ingest
//! report are stored as JSON text next to the version and digest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use dhis2_bridge_core::store::{BoundaryStore, CachedBoundaries};

/// SQLite implementation of the [`BoundaryStore`] trait.
pub struct SqliteBoundaryStore {
    pool: SqlitePool,
}

impl SqliteBoundaryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BoundaryStore for SqliteBoundaryStore {
    async fn load(&self, level_key: &str) -> Result<Option<CachedBoundaries>> {
        let row = sqlx::query(
            "SELECT level_key, version, fetched_at, digest, collection_json, report_json \
             FROM boundary_cache WHERE level_key = ?",
        )
        .bind(level_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let collection_json: String = row.get("collection_json");
        let report_json: String = row.get("report_json");
        let entry = CachedBoundaries {
            level_key: row.get("level_key"),
            version: row.get("version"),
            fetched_at: row.get("fetched_at"),
            digest: row.get("digest"),
            collection: serde_json::from_str(&collection_json)
                .with_context(|| format!("corrupt boundary_cache row for levels {}", level_key))?,
            report: serde_json::from_str(&report_json).unwrap_or_default(),
        };
        Ok(Some(entry))
    }

    async fn save(&self, entry: &CachedBoundaries) -> Result<()> {
        let collection_json = serde_json::to_string(&entry.collection)?;
        let report_json = serde_json::to_string(&entry.report)?;

        sqlx::query(
            r#"
            INSERT INTO boundary_cache (level_key, version, fetched_at, digest, collection_json, report_json)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(level_key) DO UPDATE SET
                version = excluded.version,
                fetched_at = excluded.fetched_at,
                digest = excluded.digest,
                collection_json = excluded.collection_json,
                report_json = excluded.report_json
            "#,
        )
        .bind(&entry.level_key)
        .bind(&entry.version)
        .bind(entry.fetched_at)
        .bind(&entry.digest)
        .bind(&collection_json)
        .bind(&report_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_version_prefix(&self, prefix: &str) -> Result<u64> {
        // substr comparison avoids LIKE wildcards in the prefix
        let result = sqlx::query(
            "DELETE FROM boundary_cache WHERE substr(version, 1, length(?1)) = ?1",
        )
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhis2_bridge_core::geometry::{ingest, GeoFeatureRow, RawCoordinates};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        pool
    }

    fn entry(levels: &[u32], version: &str) -> CachedBoundaries {
        let (collection, report) = ingest(
            vec![GeoFeatureRow {
                id: "O6uvpzGd5pu".to_string(),
                name: "Bo".to_string(),
                level: Some(2),
                declared: Some(2),
                coordinates: Some(RawCoordinates::Array(json!([[[0, 0], [1, 0], [1, 1], [0, 0]]]))),
            }],
            2,
        );
        CachedBoundaries::new(levels, version, 1_700_000_000, collection, report)
    }

    #[tokio::test]
    async fn test_round_trip_preserves_digest() {
        let store = SqliteBoundaryStore::new(memory_pool().await);
        let saved = entry(&[2], "v1");
        store.save(&saved).await.unwrap();

        let loaded = store.load("2").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(loaded.is_intact());
    }

    #[tokio::test]
    async fn test_upsert_and_prefix_delete() {
        let store = SqliteBoundaryStore::new(memory_pool().await);
        store.save(&entry(&[2], "v1")).await.unwrap();
        store.save(&entry(&[2], "v2")).await.unwrap();
        store.save(&entry(&[3], "v2_%")).await.unwrap();

        assert_eq!(store.load("2").await.unwrap().unwrap().version, "v2");
        assert_eq!(store.delete_version_prefix("v2_").await.unwrap(), 1);
        assert_eq!(store.delete_version_prefix("v").await.unwrap(), 1);
        assert!(store.load("2").await.unwrap().is_none());
    }
}
