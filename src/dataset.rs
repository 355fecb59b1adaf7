//! Dataset pipeline.
//!
//! `descriptor → periods → fetch → pivot → (temporal opt-in) → project`
//!
//! Validation (descriptor, periods, column references that can be checked
//! up front) happens before any network I/O. Column introspection runs the
//! same pipeline and returns only the columns, so the names a host sees at
//! registration time are the names its later queries get back.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use dhis2_bridge_core::descriptor::{self, QueryDescriptor};
use dhis2_bridge_core::models::{Dataset, DatasetColumn, PERIOD_COLUMN};
use dhis2_bridge_core::period::resolve_all;
use dhis2_bridge_core::pivot::pivot;
use dhis2_bridge_core::reconcile::QueryReferences;
use dhis2_bridge_core::BridgeError;

use crate::config::Config;
use crate::fetch::{fetch_records, FetchOptions};
use crate::traits::Upstream;

/// Result of one query, as handed to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_id: String,
    pub descriptor: QueryDescriptor,
    pub periods: Vec<String>,
    pub record_count: usize,
    pub dataset: Dataset,
}

pub struct Pipeline {
    upstream: Arc<dyn Upstream>,
    options: FetchOptions,
    temporal_period: bool,
}

impl Pipeline {
    pub fn new(upstream: Arc<dyn Upstream>, options: FetchOptions) -> Self {
        Self {
            upstream,
            options,
            temporal_period: false,
        }
    }

    pub fn from_config(upstream: Arc<dyn Upstream>, config: &Config) -> Self {
        Self::new(upstream, FetchOptions::from_config(&config.upstream))
            .with_temporal_period(config.dataset.temporal_period)
    }

    /// Mark the `period` column temporal in every produced dataset.
    pub fn with_temporal_period(mut self, enabled: bool) -> Self {
        self.temporal_period = enabled;
        self
    }

    pub fn upstream(&self) -> Arc<dyn Upstream> {
        self.upstream.clone()
    }

    /// Parse `raw` and run it.
    pub async fn run_raw(
        &self,
        raw: &str,
        reference: NaiveDate,
        refs: &QueryReferences,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, BridgeError> {
        let query = descriptor::parse(raw)?;
        self.run(&query, reference, refs, cancel).await
    }

    /// Run a parsed query and project the result by `refs`.
    pub async fn run(
        &self,
        query: &QueryDescriptor,
        reference: NaiveDate,
        refs: &QueryReferences,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, BridgeError> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("query", id = %query_id);

        async {
            let periods = resolve_all(&query.periods, reference);
            tracing::info!(
                reference = %reference,
                periods = %periods.join(";"),
                "running {}",
                query.summary()
            );

            let records =
                fetch_records(self.upstream.clone(), query, &periods, &self.options, cancel).await?;
            let record_count = records.len();

            let mut dataset = pivot(&records)?;
            if self.temporal_period {
                dataset.mark_temporal(PERIOD_COLUMN);
            }
            let dataset = if refs.is_empty() {
                dataset
            } else {
                dataset.project(refs)?
            };

            tracing::info!(
                records = record_count,
                rows = dataset.rows.len(),
                columns = dataset.columns.len(),
                "query complete"
            );

            Ok(QueryResult {
                query_id: query_id.clone(),
                descriptor: query.clone(),
                periods,
                record_count,
                dataset,
            })
        }
        .instrument(span)
        .await
    }

    /// Column metadata for a descriptor.
    pub async fn columns(
        &self,
        raw: &str,
        reference: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<DatasetColumn>, BridgeError> {
        let result = self
            .run_raw(raw, reference, &QueryReferences::default(), cancel)
            .await?;
        Ok(result.dataset.columns)
    }
}

/// Today's date in UTC, the default period reference.
pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}
