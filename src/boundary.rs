//! Boundary ingestor.
//!
//! Fetches `geoFeatures` for one or more organisation-unit levels and runs
//! every row through [`dhis2_bridge_core::geometry::correct`]. Rows are
//! decoded one at a time so a single malformed feature is rejected on its
//! own instead of failing the level.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use dhis2_bridge_core::geometry::{ingest, FeatureCollection, GeoFeatureRow, IngestReport, RejectedFeature};
use dhis2_bridge_core::models::EndpointFamily;
use dhis2_bridge_core::BridgeError;

use crate::traits::Upstream;

/// Query parameters selecting all features of one level.
pub fn level_params(level: u32) -> Vec<(String, String)> {
    vec![
        ("ou".to_string(), format!("ou:LEVEL-{}", level)),
        ("displayProperty".to_string(), "NAME".to_string()),
    ]
}

fn decode_rows(body: Value) -> Result<(Vec<GeoFeatureRow>, Vec<RejectedFeature>), BridgeError> {
    let Value::Array(items) = body else {
        return Err(BridgeError::UpstreamMalformed {
            endpoint: EndpointFamily::GeoFeatures,
            message: "expected a JSON array of features".to_string(),
        });
    };

    let mut rows = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for item in items {
        let feature_id = item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value::<GeoFeatureRow>(item) {
            Ok(row) => rows.push(row),
            Err(e) => rejected.push(RejectedFeature {
                feature_id,
                reason: format!("unreadable feature: {}", e),
            }),
        }
    }
    Ok((rows, rejected))
}

/// Fetch and correct every feature of one level.
pub async fn fetch_level(
    upstream: &dyn Upstream,
    level: u32,
) -> Result<(FeatureCollection, IngestReport), BridgeError> {
    let family = EndpointFamily::GeoFeatures;
    let body = upstream
        .get_json(family, family.path(), &level_params(level))
        .await?;
    let (rows, unreadable) = decode_rows(body)?;

    let (collection, mut report) = ingest(rows, level);
    report.rejected.extend(unreadable);

    for r in &report.rejected {
        tracing::warn!(level, feature = %r.feature_id, reason = %r.reason, "rejected boundary feature");
    }
    tracing::info!(
        level,
        accepted = report.accepted,
        corrected = report.corrected,
        rejected = report.rejected.len(),
        "ingested boundary level"
    );
    Ok((collection, report))
}

/// Fetch several levels concurrently and merge them by feature id.
///
/// Levels are merged in the order given; a feature id present in more than
/// one level keeps the later level's version.
pub async fn fetch_levels(
    upstream: Arc<dyn Upstream>,
    levels: &[u32],
    max_concurrency: usize,
) -> Result<(FeatureCollection, IngestReport), BridgeError> {
    let per_level = stream::iter(levels.iter().copied())
        .map(|level| {
            let upstream = upstream.clone();
            async move { fetch_level(upstream.as_ref(), level).await }
        })
        .buffered(max_concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    let mut collection = FeatureCollection::default();
    let mut report = IngestReport::default();
    for (c, r) in per_level {
        collection.merge(c);
        report.merge(r);
    }
    Ok((collection, report))
}
