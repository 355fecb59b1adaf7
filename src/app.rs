//! Wiring shared by the CLI and the HTTP server.

use anyhow::{Context, Result};
use std::sync::Arc;

use dhis2_bridge_core::store::BoundaryStore;

use crate::cache::BoundaryCache;
use crate::client::HttpUpstream;
use crate::config::Config;
use crate::dataset::Pipeline;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteBoundaryStore;
use crate::traits::Upstream;

/// Everything a command or request handler needs.
pub struct App {
    pub config: Arc<Config>,
    pub pipeline: Pipeline,
    pub cache: BoundaryCache,
}

impl App {
    /// Build against the configured upstream, opening the SQLite boundary
    /// store when `cache.persist` is set.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let upstream: Arc<dyn Upstream> = Arc::new(
            HttpUpstream::from_config(&config.upstream)
                .context("Failed to build upstream client")?,
        );

        let store: Option<Arc<dyn BoundaryStore>> = if config.cache.persist {
            let pool = db::connect(config)
                .await
                .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
            migrate::apply(&pool).await?;
            Some(Arc::new(SqliteBoundaryStore::new(pool)))
        } else {
            None
        };

        Ok(Self::with_upstream(config, upstream, store))
    }

    /// Build around an existing upstream (tests, embedding).
    pub fn with_upstream(
        config: &Config,
        upstream: Arc<dyn Upstream>,
        store: Option<Arc<dyn BoundaryStore>>,
    ) -> Self {
        let pipeline = Pipeline::from_config(upstream.clone(), config);
        let mut cache = BoundaryCache::new(upstream)
            .with_limits(config.upstream.max_concurrency, config.upstream.deadline());
        if let Some(store) = store {
            cache = cache.with_store(store);
        }
        Self {
            config: Arc::new(config.clone()),
            pipeline,
            cache,
        }
    }

    pub fn cache_version(&self) -> &str {
        &self.config.cache.version
    }
}
