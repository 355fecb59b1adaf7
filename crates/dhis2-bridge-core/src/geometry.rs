//! Boundary geometry correction.
//!
//! The upstream `geoFeatures` endpoint declares a geometry type per feature
//! (`ty`), but the declaration is unreliable: multi-part districts are often
//! declared as plain polygons. The authoritative type is derived once, at
//! ingestion, from the nesting depth of the coordinates:
//!
//! | Depth | Example | Type |
//! |-------|---------|------|
//! | 1 | `[x, y]` | `POINT` |
//! | 2 | `[[x, y], …]` | `LINESTRING` |
//! | 3 | `[[[x, y], …], …]` | `POLYGON` |
//! | 4 | `[[[[x, y], …], …], …]` | `MULTIPOLYGON` |
//!
//! Features whose coordinates resolve to none of these are rejected one by
//! one and counted in the [`IngestReport`]; they never fail the batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
    MultiPolygon,
}

impl GeometryType {
    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(GeometryType::Point),
            2 => Some(GeometryType::LineString),
            3 => Some(GeometryType::Polygon),
            4 => Some(GeometryType::MultiPolygon),
            _ => None,
        }
    }

    /// Map the upstream `ty` code.
    pub fn from_declared_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(GeometryType::Point),
            2 => Some(GeometryType::Polygon),
            3 => Some(GeometryType::MultiPolygon),
            4 => Some(GeometryType::LineString),
            _ => None,
        }
    }

    /// GeoJSON `type` member.
    pub fn geojson_name(&self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
            GeometryType::MultiPolygon => "MultiPolygon",
        }
    }
}

/// How the authoritative geometry type relates to the declared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TypeResolution {
    /// Declared type agrees with the coordinates.
    Matched,
    /// Declared type disagreed; the computed type replaced it.
    Corrected { declared: GeometryType },
    /// No (recognizable) declared type; computed type used.
    Inferred,
}

/// A corrected boundary feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryFeature {
    pub id: String,
    pub name: String,
    pub level: u32,
    /// Authoritative type, computed from the coordinates.
    pub geometry_type: GeometryType,
    pub resolution: TypeResolution,
    pub coordinates: Value,
}

impl BoundaryFeature {
    pub fn was_corrected(&self) -> bool {
        matches!(self.resolution, TypeResolution::Corrected { .. })
    }
}

/// Coordinates as delivered upstream: a JSON array, or that array encoded
/// as a JSON string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawCoordinates {
    Encoded(String),
    Array(Value),
}

/// One row of the upstream `geoFeatures` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeoFeatureRow {
    pub id: String,
    #[serde(default, rename = "na")]
    pub name: String,
    #[serde(default, rename = "le")]
    pub level: Option<u32>,
    #[serde(default, rename = "ty")]
    pub declared: Option<i64>,
    #[serde(default, rename = "co")]
    pub coordinates: Option<RawCoordinates>,
}

/// Nesting depth of a coordinate array.
///
/// Nesting must be uniform, leaves must be numbers, and every innermost
/// position needs at least two numbers.
pub fn coordinate_depth(value: &Value) -> Result<usize, String> {
    match value {
        Value::Number(_) => Ok(0),
        Value::Array(items) if items.is_empty() => Err("empty coordinate array".to_string()),
        Value::Array(items) => {
            let mut depth = None;
            for item in items {
                let d = coordinate_depth(item)?;
                match depth {
                    None => depth = Some(d),
                    Some(prev) if prev != d => {
                        return Err(format!("mixed nesting depth ({} and {})", prev, d))
                    }
                    Some(_) => {}
                }
            }
            let child = depth.unwrap_or(0);
            if child == 0 && items.len() < 2 {
                return Err("position needs at least two numbers".to_string());
            }
            Ok(child + 1)
        }
        other => Err(format!("non-numeric coordinate value {}", other)),
    }
}

/// Resolve the authoritative type of a single upstream row.
///
/// `default_level` is used when the row carries no `le`.
pub fn correct(row: GeoFeatureRow, default_level: u32) -> Result<BoundaryFeature, RejectedFeature> {
    let invalid = |reason: String| RejectedFeature {
        feature_id: row.id.clone(),
        reason,
    };

    let coordinates = match &row.coordinates {
        None => return Err(invalid("missing coordinates".to_string())),
        Some(RawCoordinates::Array(v)) => v.clone(),
        Some(RawCoordinates::Encoded(s)) => serde_json::from_str::<Value>(s)
            .map_err(|e| invalid(format!("coordinates are not valid JSON: {}", e)))?,
    };

    let depth = coordinate_depth(&coordinates).map_err(&invalid)?;
    let geometry_type = GeometryType::from_depth(depth)
        .ok_or_else(|| invalid(format!("unsupported nesting depth {}", depth)))?;

    let resolution = match row.declared.and_then(GeometryType::from_declared_code) {
        Some(declared) if declared == geometry_type => TypeResolution::Matched,
        Some(declared) => TypeResolution::Corrected { declared },
        None => TypeResolution::Inferred,
    };

    Ok(BoundaryFeature {
        id: row.id,
        name: row.name,
        level: row.level.unwrap_or(default_level),
        geometry_type,
        resolution,
        coordinates,
    })
}

/// A rejected feature and the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedFeature {
    pub feature_id: String,
    pub reason: String,
}

impl From<RejectedFeature> for BridgeError {
    fn from(r: RejectedFeature) -> Self {
        BridgeError::InvalidGeometry {
            feature_id: r.feature_id,
            reason: r.reason,
        }
    }
}

/// Outcome counts of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestReport {
    pub accepted: usize,
    pub corrected: usize,
    pub rejected: Vec<RejectedFeature>,
}

impl IngestReport {
    /// Number of input features seen: accepted plus rejected.
    pub fn total(&self) -> usize {
        self.accepted + self.rejected.len()
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.accepted += other.accepted;
        self.corrected += other.corrected;
        self.rejected.extend(other.rejected);
    }
}

/// Corrected features keyed by feature id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    pub features: BTreeMap<String, BoundaryFeature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&BoundaryFeature> {
        self.features.get(id)
    }

    /// Insert all features of `other`; on duplicate ids `other` wins.
    pub fn merge(&mut self, other: FeatureCollection) {
        self.features.extend(other.features);
    }

    /// Sorted, de-duplicated list of levels present.
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.features.values().map(|f| f.level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }

    /// Standard GeoJSON `FeatureCollection` for map renderers.
    pub fn to_geojson(&self) -> Value {
        let features: Vec<Value> = self
            .features
            .values()
            .map(|f| {
                json!({
                    "type": "Feature",
                    "id": f.id,
                    "properties": {
                        "name": f.name,
                        "level": f.level,
                        "corrected": f.was_corrected(),
                    },
                    "geometry": {
                        "type": f.geometry_type.geojson_name(),
                        "coordinates": f.coordinates,
                    },
                })
            })
            .collect();
        json!({ "type": "FeatureCollection", "features": features })
    }

    /// SHA-256 of the serialized collection, hex-encoded.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Correct a batch of upstream rows for one level.
///
/// Every row ends up either in the collection or in `report.rejected`.
pub fn ingest(rows: Vec<GeoFeatureRow>, level: u32) -> (FeatureCollection, IngestReport) {
    let mut collection = FeatureCollection::default();
    let mut report = IngestReport::default();

    for row in rows {
        match correct(row, level) {
            Ok(feature) => {
                report.accepted += 1;
                if feature.was_corrected() {
                    report.corrected += 1;
                }
                collection.features.insert(feature.id.clone(), feature);
            }
            Err(rejected) => report.rejected.push(rejected),
        }
    }

    (collection, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, ty: Option<i64>, co: Value) -> GeoFeatureRow {
        GeoFeatureRow {
            id: id.to_string(),
            name: format!("{} name", id),
            level: Some(2),
            declared: ty,
            coordinates: Some(RawCoordinates::Array(co)),
        }
    }

    fn square() -> Value {
        json!([[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]])
    }

    #[test]
    fn test_depths() {
        assert_eq!(coordinate_depth(&json!([1.0, 2.0])), Ok(1));
        assert_eq!(coordinate_depth(&json!([[1.0, 2.0], [3.0, 4.0]])), Ok(2));
        assert_eq!(coordinate_depth(&square()), Ok(3));
        assert_eq!(coordinate_depth(&json!([square()])), Ok(4));
    }

    #[test]
    fn test_depth_errors() {
        assert!(coordinate_depth(&json!([])).is_err());
        assert!(coordinate_depth(&json!([1.0])).is_err());
        assert!(coordinate_depth(&json!([[1.0, 2.0], 3.0])).is_err());
        assert!(coordinate_depth(&json!([["a", "b"]])).is_err());
    }

    #[test]
    fn test_declared_polygon_with_depth_four_is_corrected() {
        let f = correct(row("A", Some(2), json!([square(), square()])), 2).unwrap();
        assert_eq!(f.geometry_type, GeometryType::MultiPolygon);
        assert_eq!(
            f.resolution,
            TypeResolution::Corrected {
                declared: GeometryType::Polygon
            }
        );
        assert!(f.was_corrected());
    }

    #[test]
    fn test_matching_declaration() {
        let f = correct(row("A", Some(1), json!([10.5, -3.2])), 2).unwrap();
        assert_eq!(f.geometry_type, GeometryType::Point);
        assert_eq!(f.resolution, TypeResolution::Matched);
    }

    #[test]
    fn test_missing_declaration_is_inferred() {
        let f = correct(row("A", None, square()), 2).unwrap();
        assert_eq!(f.geometry_type, GeometryType::Polygon);
        assert_eq!(f.resolution, TypeResolution::Inferred);
    }

    #[test]
    fn test_depth_five_rejected() {
        let rejected = correct(row("deep", Some(3), json!([[square()]])), 2).unwrap_err();
        assert_eq!(rejected.feature_id, "deep");
        assert!(rejected.reason.contains("depth 5"), "reason: {}", rejected.reason);

        let err = BridgeError::from(rejected);
        assert_eq!(err.code(), "invalid_geometry");
    }

    #[test]
    fn test_encoded_coordinates_are_decoded() {
        let r = GeoFeatureRow {
            id: "E".to_string(),
            name: "Encoded".to_string(),
            level: None,
            declared: Some(2),
            coordinates: Some(RawCoordinates::Encoded(
                "[[[0,0],[1,0],[1,1],[0,0]]]".to_string(),
            )),
        };
        let f = correct(r, 3).unwrap();
        assert_eq!(f.geometry_type, GeometryType::Polygon);
        assert_eq!(f.level, 3);
    }

    #[test]
    fn test_row_deserializes_from_upstream_shape() {
        let rows: Vec<GeoFeatureRow> = serde_json::from_value(json!([
            { "id": "O6uvpzGd5pu", "na": "Bo", "le": 2, "ty": 2, "co": "[[[1,2],[3,4],[5,6],[1,2]]]" },
            { "id": "fdc6uOvgoji", "na": "Bombali", "le": 2, "ty": 2, "co": [[[1,2],[3,4],[5,6],[1,2]]] },
            { "id": "noGeo", "na": "Nowhere", "le": 2 }
        ]))
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(matches!(rows[0].coordinates, Some(RawCoordinates::Encoded(_))));
        assert!(matches!(rows[1].coordinates, Some(RawCoordinates::Array(_))));
        assert_eq!(rows[2].coordinates, None);
    }

    #[test]
    fn test_ingest_counts_every_feature() {
        let rows = vec![
            row("ok", Some(2), square()),
            row("fixed", Some(2), json!([square()])),
            row("deep", Some(3), json!([[square()]])),
            row("empty", Some(2), json!([])),
            GeoFeatureRow {
                id: "bad-json".to_string(),
                name: String::new(),
                level: Some(2),
                declared: Some(2),
                coordinates: Some(RawCoordinates::Encoded("[[[0,0],".to_string())),
            },
        ];
        let input = rows.len();
        let (collection, report) = ingest(rows, 2);

        assert_eq!(report.accepted, 2);
        assert_eq!(report.corrected, 1);
        assert_eq!(report.rejected.len(), 3);
        assert_eq!(report.total(), input);
        assert_eq!(collection.len(), 2);
        assert!(collection.get("deep").is_none());
    }

    #[test]
    fn test_geojson_uses_corrected_type() {
        let (collection, _) = ingest(vec![row("A", Some(2), json!([square()]))], 2);
        let gj = collection.to_geojson();
        assert_eq!(gj["type"], "FeatureCollection");
        assert_eq!(gj["features"][0]["geometry"]["type"], "MultiPolygon");
        assert_eq!(gj["features"][0]["properties"]["corrected"], true);
    }

    #[test]
    fn test_digest_is_stable() {
        let (a, _) = ingest(vec![row("A", Some(2), square()), row("B", Some(2), square())], 2);
        let (b, _) = ingest(vec![row("B", Some(2), square()), row("A", Some(2), square())], 2);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
