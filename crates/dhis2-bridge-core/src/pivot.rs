//! Long-to-wide pivot.
//!
//! Groups [`LongRecord`]s by (period, org unit) and scatters each value into
//! the metric column derived from its indicator label:
//!
//! ```text
//! period  orgUnit  indicator  value          period  orgUnit  X  Y
//! 2024    A        X          5        ──▶   2024    A        5  7
//! 2024    A        Y          7
//! ```
//!
//! Column names come from [`sanitize`](crate::sanitize::sanitize). When two
//! distinct labels sanitize to the same name, the later one (in input
//! order) gets `_2`, `_3`, … appended. The bookkeeping lives in a
//! [`ColumnAllocator`] scoped to one pivot call, so separate datasets never
//! influence each other's names.

use std::collections::{HashMap, HashSet};

use crate::error::BridgeError;
use crate::models::{
    CellValue, Dataset, DatasetColumn, LongRecord, WideRow, ORG_UNIT_COLUMN, ORG_UNIT_NAME_COLUMN,
    PERIOD_COLUMN,
};
use crate::sanitize::sanitize_or_placeholder;

/// Assigns unique column names within a single dataset.
#[derive(Debug, Default)]
pub struct ColumnAllocator {
    used: HashSet<String>,
}

impl ColumnAllocator {
    /// An allocator with the fixed dimension column names already taken.
    pub fn with_dimensions() -> Self {
        let mut used = HashSet::new();
        for name in [PERIOD_COLUMN, ORG_UNIT_COLUMN, ORG_UNIT_NAME_COLUMN] {
            used.insert(name.to_string());
        }
        Self { used }
    }

    /// Name for a label first seen at 1-based metric `position`.
    pub fn allocate(&mut self, label: &str, position: usize) -> String {
        let base = sanitize_or_placeholder(label, position);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

struct RowAccumulator {
    period: String,
    org_unit: String,
    org_unit_name: Option<String>,
    cells: HashMap<usize, Option<f64>>,
}

/// Pivot long-format records into a wide dataset.
///
/// Rows and metric columns keep first-seen input order. Every row carries
/// every column; missing metric values are explicit nulls. Duplicate cells
/// (same row and metric) are summed, with null treated as absent.
///
/// # Errors
///
/// [`BridgeError::ColumnCollision`] if the produced column set is not
/// unique. That indicates a defect in the allocator, never bad input.
pub fn pivot(records: &[LongRecord]) -> Result<Dataset, BridgeError> {
    let mut allocator = ColumnAllocator::with_dimensions();
    let mut metrics: Vec<DatasetColumn> = Vec::new();
    let mut metric_index: HashMap<&str, usize> = HashMap::new();
    let mut rows: Vec<RowAccumulator> = Vec::new();
    let mut row_index: HashMap<(&str, &str), usize> = HashMap::new();

    for rec in records {
        let col = match metric_index.get(rec.indicator_label.as_str()) {
            Some(&i) => i,
            None => {
                let position = metrics.len() + 1;
                let name = allocator.allocate(&rec.indicator_label, position);
                metrics.push(DatasetColumn::metric(name, rec.indicator_label.clone()));
                metric_index.insert(rec.indicator_label.as_str(), metrics.len() - 1);
                metrics.len() - 1
            }
        };

        let key = (rec.period.as_str(), rec.org_unit.as_str());
        let row = match row_index.get(&key) {
            Some(&i) => &mut rows[i],
            None => {
                let i = rows.len();
                rows.push(RowAccumulator {
                    period: rec.period.clone(),
                    org_unit: rec.org_unit.clone(),
                    org_unit_name: None,
                    cells: HashMap::new(),
                });
                row_index.insert(key, i);
                &mut rows[i]
            }
        };

        if row.org_unit_name.is_none() {
            row.org_unit_name = rec.org_unit_name.clone();
        }

        let cell = row.cells.entry(col).or_insert(None);
        *cell = match (*cell, rec.value) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    let has_names = rows.iter().any(|r| r.org_unit_name.is_some());

    let mut columns = vec![
        DatasetColumn::dimension(PERIOD_COLUMN),
        DatasetColumn::dimension(ORG_UNIT_COLUMN),
    ];
    if has_names {
        columns.push(DatasetColumn::dimension(ORG_UNIT_NAME_COLUMN));
    }
    columns.extend(metrics.iter().cloned());
    check_unique(&columns)?;

    let wide_rows = rows
        .into_iter()
        .map(|acc| {
            let mut row = WideRow::default();
            row.insert(PERIOD_COLUMN, CellValue::Text(acc.period));
            row.insert(ORG_UNIT_COLUMN, CellValue::Text(acc.org_unit));
            if has_names {
                row.insert(
                    ORG_UNIT_NAME_COLUMN,
                    acc.org_unit_name.map(CellValue::Text).unwrap_or(CellValue::Null),
                );
            }
            for (i, metric) in metrics.iter().enumerate() {
                let value = acc.cells.get(&i).copied().flatten();
                row.insert(metric.name.clone(), CellValue::from(value));
            }
            row
        })
        .collect();

    Ok(Dataset {
        columns,
        rows: wide_rows,
    })
}

fn check_unique(columns: &[DatasetColumn]) -> Result<(), BridgeError> {
    let mut seen = HashSet::new();
    for c in columns {
        if !seen.insert(c.name.as_str()) {
            return Err(BridgeError::ColumnCollision {
                name: c.name.clone(),
            });
        }
    }
    Ok(())
}
