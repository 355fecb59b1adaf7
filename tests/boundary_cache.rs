//! Boundary cache behaviour against counting fake upstreams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use serde_json::{json, Value};

use dhis2_bridge::cache::BoundaryCache;
use dhis2_bridge::client::{Credentials, HttpUpstream};
use dhis2_bridge::traits::Upstream;
use dhis2_bridge_core::geometry::GeometryType;
use dhis2_bridge_core::models::EndpointFamily;
use dhis2_bridge_core::store::memory::InMemoryBoundaryStore;
use dhis2_bridge_core::store::BoundaryStore;
use dhis2_bridge_core::BridgeError;

/// Serves two features per level and counts calls. The first feature is
/// declared POLYGON but nested as a MULTIPOLYGON.
struct CountingUpstream {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingUpstream {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn level_of(params: &[(String, String)]) -> u32 {
    params
        .iter()
        .find_map(|(k, v)| {
            if k == "ou" {
                v.strip_prefix("ou:LEVEL-").and_then(|l| l.parse().ok())
            } else {
                None
            }
        })
        .unwrap_or(0)
}

#[async_trait]
impl Upstream for CountingUpstream {
    async fn get_json(
        &self,
        family: EndpointFamily,
        _path: &str,
        params: &[(String, String)],
    ) -> Result<Value, BridgeError> {
        assert_eq!(family, EndpointFamily::GeoFeatures);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let level = level_of(params);
        Ok(json!([
            {
                "id": format!("multi-{}", level), "na": "Islands", "le": level, "ty": 2,
                "co": "[[[[0,0],[1,0],[1,1],[0,0]]],[[[2,2],[3,2],[3,3],[2,2]]]]"
            },
            {
                "id": format!("point-{}", level), "na": "Clinic", "le": level, "ty": 1,
                "co": [10.5, 8.25]
            }
        ]))
    }
}

#[tokio::test]
async fn concurrent_misses_share_one_fetch() {
    //* Given
    let upstream = Arc::new(CountingUpstream::new(Duration::from_millis(50)));
    let cache = BoundaryCache::new(upstream.clone());

    //* When
    let (a, b) = tokio::join!(cache.get_or_fetch(&[2], "v1"), cache.get_or_fetch(&[2], "v1"));

    //* Then
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(upstream.calls(), 1);
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn geometry_is_corrected_on_ingest() {
    let upstream = Arc::new(CountingUpstream::new(Duration::ZERO));
    let cache = BoundaryCache::new(upstream);

    let entry = cache.get_or_fetch(&[2], "v1").await.unwrap();

    let multi = entry.collection.get("multi-2").unwrap();
    assert_eq!(multi.geometry_type, GeometryType::MultiPolygon);
    assert!(multi.was_corrected());
    assert_eq!(entry.report.accepted, 2);
    assert_eq!(entry.report.corrected, 1);
    assert!(entry.report.rejected.is_empty());
}

#[tokio::test]
async fn level_order_does_not_change_the_key() {
    let upstream = Arc::new(CountingUpstream::new(Duration::ZERO));
    let cache = BoundaryCache::new(upstream.clone());

    let first = cache.get_or_fetch(&[3, 2], "v1").await.unwrap();
    let second = cache.get_or_fetch(&[2, 3], "v1").await.unwrap();

    assert_eq!(first.level_key, "2,3");
    assert!(Arc::ptr_eq(&first, &second));
    // one call per level, once
    assert_eq!(upstream.calls(), 2);
    assert_eq!(first.collection.len(), 4);
}

#[tokio::test]
async fn repeated_levels_are_fetched_once() {
    //* Given
    let upstream = Arc::new(CountingUpstream::new(Duration::ZERO));
    let cache = BoundaryCache::new(upstream.clone());

    //* When
    let entry = cache.get_or_fetch(&[2, 2], "v1").await.unwrap();

    //* Then
    assert_eq!(upstream.calls(), 1);
    assert_eq!(entry.level_key, "2");
    assert_eq!(entry.collection.len(), 2);
    assert_eq!(entry.report.accepted, 2);
    assert_eq!(entry.report.total(), entry.collection.len());
}

#[tokio::test]
async fn invalidate_waits_for_fetch_in_flight() {
    //* Given
    let store = Arc::new(InMemoryBoundaryStore::new());
    let upstream = Arc::new(CountingUpstream::new(Duration::from_millis(200)));
    let cache = Arc::new(BoundaryCache::new(upstream.clone()).with_store(store.clone()));

    let fetching = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_fetch(&[2], "v1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    //* When
    let report = cache.invalidate("v1").await.unwrap();

    //* Then
    // the in-flight fetch still succeeds for its own caller
    let entry = fetching.await.unwrap().unwrap();
    assert_eq!(entry.collection.len(), 2);
    assert_eq!(report.memory, 1);
    assert_eq!(report.persisted, 1);
    assert!(cache.peek(&[2], "v1").is_none());
    assert!(store.load("2").await.unwrap().is_none());
}

#[tokio::test]
async fn version_bump_refetches_and_replaces() {
    let upstream = Arc::new(CountingUpstream::new(Duration::ZERO));
    let cache = BoundaryCache::new(upstream.clone());

    let v1 = cache.get_or_fetch(&[2], "v1").await.unwrap();
    let v2 = cache.get_or_fetch(&[2], "v2").await.unwrap();

    assert_eq!(upstream.calls(), 2);
    assert_eq!(v1.version, "v1");
    assert_eq!(v2.version, "v2");
    assert_eq!(cache.len(), 1);
    assert!(cache.peek(&[2], "v1").is_none());
}

#[tokio::test]
async fn store_hit_skips_upstream() {
    let store = Arc::new(InMemoryBoundaryStore::new());

    let first = Arc::new(CountingUpstream::new(Duration::ZERO));
    BoundaryCache::new(first.clone())
        .with_store(store.clone())
        .get_or_fetch(&[2], "v1")
        .await
        .unwrap();
    assert_eq!(first.calls(), 1);

    // a fresh process with an empty memory tier
    let second = Arc::new(CountingUpstream::new(Duration::ZERO));
    let entry = BoundaryCache::new(second.clone())
        .with_store(store.clone())
        .get_or_fetch(&[2], "v1")
        .await
        .unwrap();
    assert_eq!(second.calls(), 0);
    assert_eq!(entry.collection.len(), 2);
}

#[tokio::test]
async fn invalidate_clears_memory_and_store() {
    let store = Arc::new(InMemoryBoundaryStore::new());
    let upstream = Arc::new(CountingUpstream::new(Duration::ZERO));
    let cache = BoundaryCache::new(upstream.clone()).with_store(store.clone());

    cache.get_or_fetch(&[2], "v1").await.unwrap();
    cache.get_or_fetch(&[3], "v1").await.unwrap();
    cache.get_or_fetch(&[4], "v2").await.unwrap();

    let report = cache.invalidate("v1").await.unwrap();
    assert_eq!(report.memory, 2);
    assert_eq!(report.persisted, 2);
    assert!(store.load("2").await.unwrap().is_none());
    assert!(store.load("4").await.unwrap().is_some());

    cache.get_or_fetch(&[2], "v1").await.unwrap();
    assert_eq!(upstream.calls(), 4);
}

#[tokio::test]
async fn empty_level_set_is_rejected() {
    let cache = BoundaryCache::new(Arc::new(CountingUpstream::new(Duration::ZERO)));
    assert!(matches!(
        cache.get_or_fetch(&[], "v1").await,
        Err(BridgeError::InvalidDescriptor { .. })
    ));
}

#[tokio::test]
async fn http_geo_features_with_bad_rows() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/geoFeatures")
        .match_query(Matcher::UrlEncoded("ou".into(), "ou:LEVEL-2".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([
                {"id": "ok", "na": "Bo", "le": 2, "ty": 2, "co": "[[[0,0],[1,0],[1,1],[0,0]]]"},
                {"id": "deep", "na": "Too deep", "le": 2, "ty": 3, "co": [[[[[0,0],[1,1]]]]]},
                {"id": "empty", "na": "Empty", "le": 2, "ty": 2, "co": "[]"}
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let upstream =
        HttpUpstream::new(&server.url(), Credentials::Anonymous, Duration::from_secs(5)).unwrap();
    let cache = BoundaryCache::new(Arc::new(upstream));

    //* When
    let entry = cache.get_or_fetch(&[2], "v1").await.unwrap();

    //* Then
    mock.assert_async().await;
    assert_eq!(entry.collection.len(), 1);
    assert_eq!(entry.report.accepted, 1);
    assert_eq!(entry.report.rejected.len(), 2);
    assert_eq!(entry.collection.to_geojson()["features"][0]["geometry"]["type"], "Polygon");
}

#[tokio::test]
async fn upstream_failure_is_not_cached() {
    let mut server = Server::new_async().await;
    let _down = server
        .mock("GET", "/api/geoFeatures")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;
    let upstream =
        HttpUpstream::new(&server.url(), Credentials::Anonymous, Duration::from_secs(5)).unwrap();
    let cache = BoundaryCache::new(Arc::new(upstream));

    let err = cache.get_or_fetch(&[2], "v1").await.unwrap_err();
    assert!(matches!(err, BridgeError::UpstreamUnavailable { endpoint: EndpointFamily::GeoFeatures, .. }));
    assert!(cache.is_empty());
}
