//! Boundary cache.
//!
//! Maps a level set (`"2,3"`) to the corrected feature collection for those
//! levels, tagged with the cache version it was built under. Lookups go
//! memory → persistent store → upstream:
//!
//! ```text
//!  get_or_fetch(levels, version)
//!     │ read lock, version matches ──────────────▶ hit
//!     ▼
//!  per-key gate (tokio Mutex)            ◀── concurrent misses wait here
//!     │ re-check memory ─────────────────────────▶ hit (filled by the leader)
//!     │ store.load, version matches ─────────────▶ promote to memory
//!     ▼
//!  boundary::fetch_levels ─▶ store.save ─▶ write lock, replace entry
//! ```
//!
//! Entries are `Arc`s replaced wholesale under the write lock, so readers see
//! either the old collection or the new one, never a mix.
//!
//! [`BoundaryCache::invalidate`] takes every gate before clearing, so a fetch
//! already in flight finishes first and is then cleared with the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use dhis2_bridge_core::store::{level_key, normalize_levels, BoundaryStore, CachedBoundaries};
use dhis2_bridge_core::BridgeError;

use crate::boundary;
use crate::traits::Upstream;

/// Entries removed by [`BoundaryCache::invalidate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidateReport {
    pub memory: u64,
    pub persisted: u64,
}

pub struct BoundaryCache {
    upstream: Arc<dyn Upstream>,
    store: Option<Arc<dyn BoundaryStore>>,
    entries: RwLock<HashMap<String, Arc<CachedBoundaries>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_concurrency: usize,
    deadline: Duration,
}

impl BoundaryCache {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            store: None,
            entries: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            max_concurrency: 4,
            deadline: Duration::from_secs(120),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BoundaryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_limits(mut self, max_concurrency: usize, deadline: Duration) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.deadline = deadline;
        self
    }

    /// The in-memory entry for `levels`, if it was built under `version`.
    pub fn peek(&self, levels: &[u32], version: &str) -> Option<Arc<CachedBoundaries>> {
        let key = level_key(levels);
        let entries = self.entries.read().ok()?;
        entries
            .get(&key)
            .filter(|e| e.version == version)
            .cloned()
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.entry(key.to_string()).or_default().clone()
    }

    fn put(&self, entry: Arc<CachedBoundaries>) {
        let mut entries = match self.entries.write() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(entry.level_key.clone(), entry);
    }

    /// Corrected boundaries for `levels` under cache `version`.
    ///
    /// Concurrent misses for the same key coalesce into one upstream fetch.
    /// A version mismatch is treated as a miss and replaces the entry.
    pub async fn get_or_fetch(
        &self,
        levels: &[u32],
        version: &str,
    ) -> Result<Arc<CachedBoundaries>, BridgeError> {
        if levels.is_empty() {
            return Err(BridgeError::InvalidDescriptor {
                message: "at least one boundary level is required".to_string(),
            });
        }
        if let Some(hit) = self.peek(levels, version) {
            tracing::debug!(levels = %hit.level_key, "boundary cache hit");
            return Ok(hit);
        }

        let levels = normalize_levels(levels);
        let key = level_key(&levels);
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if let Some(hit) = self.peek(&levels, version) {
            tracing::debug!(levels = %key, "boundary cache filled while waiting");
            return Ok(hit);
        }

        if let Some(ref store) = self.store {
            match store.load(&key).await {
                Ok(Some(stored)) if stored.version == version && stored.is_intact() => {
                    tracing::debug!(levels = %key, "boundary cache loaded from store");
                    let entry = Arc::new(stored);
                    self.put(entry.clone());
                    return Ok(entry);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(levels = %key, error = %e, "boundary store load failed"),
            }
        }

        tracing::info!(levels = %key, version, "boundary cache miss; fetching");
        let fetch = boundary::fetch_levels(self.upstream.clone(), &levels, self.max_concurrency);
        let (collection, report) = tokio::time::timeout(self.deadline, fetch)
            .await
            .map_err(|_| BridgeError::DeadlineExceeded)??;

        let entry = Arc::new(CachedBoundaries::new(
            &levels,
            version,
            chrono::Utc::now().timestamp(),
            collection,
            report,
        ));

        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&entry).await {
                tracing::warn!(levels = %key, error = %e, "boundary store save failed");
            }
        }
        self.put(entry.clone());
        Ok(entry)
    }

    /// Drop every entry whose version starts with `prefix`, in memory and
    /// in the store.
    ///
    /// Waits for fetches in flight when it is called; their results are
    /// cleared too.
    pub async fn invalidate(&self, prefix: &str) -> anyhow::Result<InvalidateReport> {
        let gates: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let gates = match self.gates.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut snapshot: Vec<(String, Arc<tokio::sync::Mutex<()>>)> = gates
                .iter()
                .map(|(k, g)| (k.clone(), g.clone()))
                .collect();
            // fixed order so concurrent invalidations cannot deadlock
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));
            snapshot.into_iter().map(|(_, g)| g).collect()
        };
        let mut held = Vec::with_capacity(gates.len());
        for gate in &gates {
            held.push(gate.lock().await);
        }

        let memory = {
            let mut entries = match self.entries.write() {
                Ok(e) => e,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = entries.len();
            entries.retain(|_, e| !e.version.starts_with(prefix));
            (before - entries.len()) as u64
        };
        let persisted = match self.store {
            Some(ref store) => store.delete_version_prefix(prefix).await?,
            None => 0,
        };
        drop(held);
        tracing::info!(prefix, memory, persisted, "boundary cache invalidated");
        Ok(InvalidateReport { memory, persisted })
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
