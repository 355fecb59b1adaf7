//! In-memory [`BoundaryStore`] implementation for tests and ephemeral runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{BoundaryStore, CachedBoundaries};

/// In-memory boundary store.
pub struct InMemoryBoundaryStore {
    entries: RwLock<HashMap<String, CachedBoundaries>>,
}

impl InMemoryBoundaryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBoundaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BoundaryStore for InMemoryBoundaryStore {
    async fn load(&self, level_key: &str) -> Result<Option<CachedBoundaries>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("boundary store lock poisoned"))?;
        Ok(entries.get(level_key).cloned())
    }

    async fn save(&self, entry: &CachedBoundaries) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("boundary store lock poisoned"))?;
        entries.insert(entry.level_key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_version_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("boundary store lock poisoned"))?;
        let before = entries.len();
        entries.retain(|_, e| !e.version.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
