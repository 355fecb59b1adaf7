//! Column reference reconciliation.
//!
//! Hosts hold on to column references for a long time: chart group-bys,
//! filters, metric definitions. Some of them were captured before a dataset
//! was re-sanitized and still carry the raw upstream label. [`reconcile`]
//! maps any such reference onto the dataset's column names, and
//! [`QueryReferences::reconcile`] applies it to every reference a query
//! touches. A reference that still fails to match is an error
//! ([`BridgeError::UnknownColumn`]), never a silent fallback to the first
//! column.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::models::{CellValue, Dataset, DatasetColumn, WideRow};
use crate::sanitize::sanitize;

/// Map a caller-supplied reference onto a sanitized column name.
///
/// 1. An exact match on a column name is returned unchanged.
/// 2. An exact match on a column's original label returns that column's
///    name (this picks the right column when collision suffixes were
///    assigned).
/// 3. Otherwise the reference is sanitized.
pub fn reconcile(reference: &str, columns: &[DatasetColumn]) -> String {
    if columns.iter().any(|c| c.name == reference) {
        return reference.to_string();
    }
    if let Some(col) = columns.iter().find(|c| c.original_label == reference) {
        return col.name.clone();
    }
    sanitize(reference)
}

/// Reconcile and require the result to be an existing column.
pub fn resolve_column<'a>(
    reference: &str,
    columns: &'a [DatasetColumn],
) -> Result<&'a DatasetColumn, BridgeError> {
    let name = reconcile(reference, columns);
    columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| BridgeError::UnknownColumn {
            reference: reference.to_string(),
        })
}

/// Keep rows whose `column` value is one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub values: Vec<String>,
}

/// Every column reference a host query carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReferences {
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub filters: Vec<ColumnFilter>,
}

impl QueryReferences {
    pub fn is_empty(&self) -> bool {
        self.group_by.is_empty() && self.metrics.is_empty() && self.filters.is_empty()
    }

    /// Apply [`reconcile`] to group-by keys, metric targets, and filter
    /// columns alike.
    pub fn reconcile(&self, columns: &[DatasetColumn]) -> QueryReferences {
        QueryReferences {
            group_by: self.group_by.iter().map(|r| reconcile(r, columns)).collect(),
            metrics: self.metrics.iter().map(|r| reconcile(r, columns)).collect(),
            filters: self
                .filters
                .iter()
                .map(|f| ColumnFilter {
                    column: reconcile(&f.column, columns),
                    values: f.values.clone(),
                })
                .collect(),
        }
    }

    /// Like [`reconcile`](Self::reconcile), but every reference must resolve.
    pub fn resolve(&self, columns: &[DatasetColumn]) -> Result<QueryReferences, BridgeError> {
        let reconciled = self.reconcile(columns);
        let originals = self
            .group_by
            .iter()
            .chain(self.metrics.iter())
            .chain(self.filters.iter().map(|f| &f.column));
        let names = reconciled
            .group_by
            .iter()
            .chain(reconciled.metrics.iter())
            .chain(reconciled.filters.iter().map(|f| &f.column));

        for (original, name) in originals.zip(names) {
            if !columns.iter().any(|c| &c.name == name) {
                return Err(BridgeError::UnknownColumn {
                    reference: original.clone(),
                });
            }
        }
        Ok(reconciled)
    }
}

impl Dataset {
    /// Project and filter the dataset by host references.
    ///
    /// Selected columns are the group-by keys followed by the metrics, in
    /// reference order; with neither given, all columns are kept. Filters
    /// keep rows whose cell renders to one of the filter values.
    pub fn project(&self, refs: &QueryReferences) -> Result<Dataset, BridgeError> {
        let resolved = refs.resolve(&self.columns)?;

        let mut selected: Vec<&str> = Vec::new();
        for name in resolved.group_by.iter().chain(resolved.metrics.iter()) {
            if !selected.contains(&name.as_str()) {
                selected.push(name);
            }
        }

        let columns: Vec<DatasetColumn> = if selected.is_empty() {
            self.columns.clone()
        } else {
            selected
                .iter()
                .filter_map(|name| self.column(name).cloned())
                .collect()
        };

        let rows = self
            .rows
            .iter()
            .filter(|row| {
                resolved.filters.iter().all(|f| {
                    row.get(&f.column)
                        .map(|cell| cell_matches(cell, &f.values))
                        .unwrap_or(false)
                })
            })
            .map(|row| {
                let mut out = WideRow::default();
                for col in &columns {
                    let value = row.get(&col.name).cloned().unwrap_or(CellValue::Null);
                    out.insert(col.name.clone(), value);
                }
                out
            })
            .collect();

        Ok(Dataset { columns, rows })
    }
}

fn cell_matches(cell: &CellValue, values: &[String]) -> bool {
    match cell {
        CellValue::Text(s) => values.iter().any(|v| v == s),
        CellValue::Number(n) => values
            .iter()
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .any(|v| v == *n),
        CellValue::Null => values.iter().any(|v| v.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LongRecord;
    use crate::pivot::pivot;

    fn malaria_columns() -> Vec<DatasetColumn> {
        vec![
            DatasetColumn::dimension("period"),
            DatasetColumn::dimension("orgUnit"),
            DatasetColumn::metric(
                "105_EP01c_Malaria_B_s".to_string(),
                "105-EP01c. Malaria (B/s)".to_string(),
            ),
        ]
    }

    #[test]
    fn test_raw_label_and_sanitized_name_agree() {
        let cols = malaria_columns();
        assert_eq!(
            reconcile("105-EP01c. Malaria (B/s)", &cols),
            reconcile("105_EP01c_Malaria_B_s", &cols)
        );
        assert_eq!(reconcile("105_EP01c_Malaria_B_s", &cols), "105_EP01c_Malaria_B_s");
    }

    #[test]
    fn test_unmatched_reference_is_sanitized() {
        let cols = malaria_columns();
        assert_eq!(reconcile("ANC 1st visit", &cols), "ANC_1st_visit");
    }

    #[test]
    fn test_original_label_finds_suffixed_column() {
        let ds = pivot(&[
            LongRecord::new("2024", "A", "a b", Some(1.0)),
            LongRecord::new("2024", "A", "a-b", Some(2.0)),
        ])
        .unwrap();
        assert_eq!(reconcile("a-b", &ds.columns), "a_b_2");
        assert_eq!(reconcile("a b", &ds.columns), "a_b");
    }

    #[test]
    fn test_resolve_column_rejects_unknown() {
        let cols = malaria_columns();
        assert_eq!(
            resolve_column("Typhoid", &cols).unwrap_err(),
            BridgeError::UnknownColumn {
                reference: "Typhoid".to_string()
            }
        );
        assert_eq!(
            resolve_column("105-EP01c. Malaria (B/s)", &cols).unwrap().name,
            "105_EP01c_Malaria_B_s"
        );
    }

    #[test]
    fn test_references_reconciled_on_every_path() {
        let cols = malaria_columns();
        let refs = QueryReferences {
            group_by: vec!["orgUnit".to_string()],
            metrics: vec!["105-EP01c. Malaria (B/s)".to_string()],
            filters: vec![ColumnFilter {
                column: "105-EP01c. Malaria (B/s)".to_string(),
                values: vec!["3".to_string()],
            }],
        };
        let r = refs.reconcile(&cols);
        assert_eq!(r.metrics, vec!["105_EP01c_Malaria_B_s"]);
        assert_eq!(r.filters[0].column, "105_EP01c_Malaria_B_s");
        assert_eq!(r.group_by, vec!["orgUnit"]);
    }

    #[test]
    fn test_project_selects_and_filters() {
        let ds = pivot(&[
            LongRecord::new("2024", "A", "Malaria (B/s)", Some(5.0)),
            LongRecord::new("2024", "A", "ANC 1", Some(7.0)),
            LongRecord::new("2024", "B", "Malaria (B/s)", Some(1.0)),
        ])
        .unwrap();

        let refs = QueryReferences {
            group_by: vec!["orgUnit".to_string()],
            metrics: vec!["Malaria (B/s)".to_string()],
            filters: vec![ColumnFilter {
                column: "orgUnit".to_string(),
                values: vec!["A".to_string()],
            }],
        };
        let out = ds.project(&refs).unwrap();
        let names: Vec<&str> = out.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["orgUnit", "Malaria_B_s"]);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].get("Malaria_B_s"), Some(&CellValue::Number(5.0)));
        assert_eq!(out.rows[0].get("ANC_1"), None);
    }

    #[test]
    fn test_project_unknown_metric_is_an_error() {
        let ds = pivot(&[LongRecord::new("2024", "A", "X", Some(5.0))]).unwrap();
        let refs = QueryReferences {
            metrics: vec!["Y".to_string()],
            ..Default::default()
        };
        assert_eq!(
            ds.project(&refs).unwrap_err(),
            BridgeError::UnknownColumn {
                reference: "Y".to_string()
            }
        );
    }

    #[test]
    fn test_project_without_selection_keeps_all_columns() {
        let ds = pivot(&[LongRecord::new("2024", "A", "X", Some(5.0))]).unwrap();
        let out = ds.project(&QueryReferences::default()).unwrap();
        assert_eq!(out, ds);
    }
}
