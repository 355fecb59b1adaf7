//! Core data types that flow through the query pipeline.
//!
//! Upstream payloads are normalized into [`LongRecord`]s at the fetch
//! boundary; the pivot turns them into a [`Dataset`] of [`DatasetColumn`]s
//! and [`WideRow`]s, which is what the host consumes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column name of the period dimension.
pub const PERIOD_COLUMN: &str = "period";
/// Column name of the organisation unit id dimension.
pub const ORG_UNIT_COLUMN: &str = "orgUnit";
/// Column name of the organisation unit display name dimension.
pub const ORG_UNIT_NAME_COLUMN: &str = "orgUnitName";

/// The three required query dimensions, named by their descriptor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    #[serde(rename = "dx")]
    Indicators,
    #[serde(rename = "pe")]
    Periods,
    #[serde(rename = "ou")]
    OrgUnits,
}

impl Dimension {
    pub fn key(&self) -> &'static str {
        match self {
            Dimension::Indicators => "dx",
            Dimension::Periods => "pe",
            Dimension::OrgUnits => "ou",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Upstream endpoint families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointFamily {
    /// `/api/analytics` — aggregate, dimension-addressed rows.
    Analytics,
    /// `/api/dataValueSets` — raw entity-level data values.
    DataValueSets,
    /// `/api/tracker/events` — individual events with data values.
    Events,
    /// `/api/geoFeatures` — per-level boundary geometry.
    GeoFeatures,
}

impl EndpointFamily {
    /// API path relative to the upstream base URL.
    pub fn path(&self) -> &'static str {
        match self {
            EndpointFamily::Analytics => "/api/analytics",
            EndpointFamily::DataValueSets => "/api/dataValueSets",
            EndpointFamily::Events => "/api/tracker/events",
            EndpointFamily::GeoFeatures => "/api/geoFeatures",
        }
    }

    /// Endpoint family addressed by a descriptor `table` value, if any.
    pub fn for_table(table: &str) -> Option<Self> {
        match table {
            "analytics" => Some(EndpointFamily::Analytics),
            "dataValueSets" => Some(EndpointFamily::DataValueSets),
            "events" => Some(EndpointFamily::Events),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointFamily::Analytics => "analytics",
            EndpointFamily::DataValueSets => "dataValueSets",
            EndpointFamily::Events => "events",
            EndpointFamily::GeoFeatures => "geoFeatures",
        };
        f.write_str(name)
    }
}

/// How the selected organisation units expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrgUnitMode {
    #[default]
    Selected,
    Children,
    Descendants,
    All,
}

impl OrgUnitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgUnitMode::Selected => "SELECTED",
            OrgUnitMode::Children => "CHILDREN",
            OrgUnitMode::Descendants => "DESCENDANTS",
            OrgUnitMode::All => "ALL",
        }
    }

    /// Parse a mode name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SELECTED" => Some(OrgUnitMode::Selected),
            "CHILDREN" => Some(OrgUnitMode::Children),
            "DESCENDANTS" => Some(OrgUnitMode::Descendants),
            "ALL" => Some(OrgUnitMode::All),
            _ => None,
        }
    }
}

/// One normalized upstream observation: (period, org unit, indicator) → value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRecord {
    pub period: String,
    pub org_unit: String,
    /// Display name of the org unit, when the upstream metadata carries one.
    pub org_unit_name: Option<String>,
    pub indicator_label: String,
    pub value: Option<f64>,
}

impl LongRecord {
    pub fn new(
        period: impl Into<String>,
        org_unit: impl Into<String>,
        indicator_label: impl Into<String>,
        value: Option<f64>,
    ) -> Self {
        Self {
            period: period.into(),
            org_unit: org_unit.into(),
            org_unit_name: None,
            indicator_label: indicator_label.into(),
            value,
        }
    }

    pub fn with_org_unit_name(mut self, name: impl Into<String>) -> Self {
        self.org_unit_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnRole {
    Dimension,
    Metric,
}

/// A column of the wide dataset, as exposed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetColumn {
    /// Sanitized identifier; the only name the host queries by.
    pub name: String,
    /// Original upstream label, kept for display and descriptions.
    pub original_label: String,
    pub role: ColumnRole,
    #[serde(default)]
    pub is_temporal: bool,
}

impl DatasetColumn {
    pub fn dimension(name: &str) -> Self {
        Self {
            name: name.to_string(),
            original_label: name.to_string(),
            role: ColumnRole::Dimension,
            is_temporal: false,
        }
    }

    pub fn metric(name: String, original_label: String) -> Self {
        Self {
            name,
            original_label,
            role: ColumnRole::Metric,
            is_temporal: false,
        }
    }
}

/// A single cell: text for dimensions, nullable number for metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Null,
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        value.map(CellValue::Number).unwrap_or(CellValue::Null)
    }
}

/// One row per (period, org unit); every dataset column has a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WideRow(pub BTreeMap<String, CellValue>);

impl WideRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        self.0.insert(column.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Column-typed row set handed to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<DatasetColumn>,
    pub rows: Vec<WideRow>,
}

impl Dataset {
    pub fn column(&self, name: &str) -> Option<&DatasetColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn metric_columns(&self) -> impl Iterator<Item = &DatasetColumn> {
        self.columns.iter().filter(|c| c.role == ColumnRole::Metric)
    }

    /// Mark a column as temporal. Returns `false` if no such column exists.
    pub fn mark_temporal(&mut self, name: &str) -> bool {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(col) => {
                col.is_temporal = true;
                true
            }
            None => false,
        }
    }
}
