//! Persistence abstraction for the boundary cache.
//!
//! The [`BoundaryStore`] trait is the second tier behind the in-process
//! cache map: entries survive restarts and are shared by every process that
//! points at the same backend. The in-process tier, single-flight gating and
//! version checks live in the application crate; a store only loads, saves,
//! and deletes whole entries.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::geometry::{FeatureCollection, IngestReport};

/// Sorted, de-duplicated copy of `levels`.
pub fn normalize_levels(levels: &[u32]) -> Vec<u32> {
    let mut sorted = levels.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Canonical cache key for a set of levels: sorted, de-duplicated,
/// comma-joined (`[3, 2, 2]` → `"2,3"`).
pub fn level_key(levels: &[u32]) -> String {
    normalize_levels(levels)
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a key produced by [`level_key`] (or user input like `"3, 2"`).
pub fn parse_level_key(raw: &str) -> Option<Vec<u32>> {
    let mut levels = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        levels.push(part.parse::<u32>().ok()?);
    }
    if levels.is_empty() {
        return None;
    }
    Some(normalize_levels(&levels))
}

/// One cached boundary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBoundaries {
    pub level_key: String,
    pub version: String,
    /// Unix seconds.
    pub fetched_at: i64,
    /// SHA-256 hex of `collection`.
    pub digest: String,
    pub collection: FeatureCollection,
    pub report: IngestReport,
}

impl CachedBoundaries {
    pub fn new(
        levels: &[u32],
        version: &str,
        fetched_at: i64,
        collection: FeatureCollection,
        report: IngestReport,
    ) -> Self {
        Self {
            level_key: level_key(levels),
            version: version.to_string(),
            fetched_at,
            digest: collection.digest(),
            collection,
            report,
        }
    }

    /// Whether the stored digest still matches the collection.
    pub fn is_intact(&self) -> bool {
        self.digest == self.collection.digest()
    }
}

/// Abstract backend for cached boundary collections.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`load`](BoundaryStore::load) | Fetch the entry for a level key, any version |
/// | [`save`](BoundaryStore::save) | Insert or replace the entry for its level key |
/// | [`delete_version_prefix`](BoundaryStore::delete_version_prefix) | Drop entries whose version starts with a prefix |
#[async_trait]
pub trait BoundaryStore: Send + Sync {
    async fn load(&self, level_key: &str) -> Result<Option<CachedBoundaries>>;

    async fn save(&self, entry: &CachedBoundaries) -> Result<()>;

    /// Returns the number of entries removed. An empty prefix removes all.
    async fn delete_version_prefix(&self, prefix: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_key_is_order_independent() {
        assert_eq!(level_key(&[3, 2, 2]), "2,3");
        assert_eq!(level_key(&[2, 3]), level_key(&[3, 2]));
        assert_eq!(level_key(&[4]), "4");
    }

    #[test]
    fn test_parse_level_key() {
        assert_eq!(parse_level_key("3, 2"), Some(vec![2, 3]));
        assert_eq!(parse_level_key("2,x"), None);
        assert_eq!(parse_level_key(""), None);
    }
}
