//! Upstream fetcher.
//!
//! Turns a validated [`QueryDescriptor`] plus its resolved period codes into
//! normalized [`LongRecord`]s. The endpoint family is chosen by the
//! descriptor's `table`:
//!
//! | Table | Request | Payload |
//! |-------|---------|---------|
//! | `analytics` | `GET /api/analytics?dimension=dx:..&dimension=pe:..&dimension=ou:..` | headers + rows, paged |
//! | `dataValueSets` | `GET /api/dataValueSets?dataElement=..&period=..&orgUnit=..` | `dataValues`, unpaged |
//! | `events` | `GET /api/tracker/events?program=..&orgUnits=..&occurredAfter=..` | `instances`, paged |
//!
//! Long `dx`/`ou` lists are split into chunks (dx-chunk × ou-chunk, in list
//! order) which run with bounded parallelism. `buffered` yields results in
//! submission order, so the merged record order depends only on the input.
//!
//! The whole fetch runs under the caller's [`CancellationToken`] and the
//! configured deadline. On either, in-flight requests are dropped and the
//! call fails; partial records are never returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dhis2_bridge_core::descriptor::QueryDescriptor;
use dhis2_bridge_core::models::{EndpointFamily, LongRecord, OrgUnitMode};
use dhis2_bridge_core::period::{date_span, Period};
use dhis2_bridge_core::BridgeError;

use crate::config::UpstreamConfig;
use crate::traits::Upstream;

/// Limits applied to one fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_concurrency: usize,
    pub max_dimension_items: usize,
    pub page_size: usize,
    pub deadline: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_dimension_items: 50,
            page_size: 1000,
            deadline: Duration::from_secs(120),
        }
    }
}

impl FetchOptions {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            max_dimension_items: config.max_dimension_items.max(1),
            page_size: config.page_size.max(1),
            deadline: config.deadline(),
        }
    }
}

// ============ Payloads ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Pager {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "first_page", rename = "pageCount")]
    pub page_count: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalyticsHeader {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetaItem {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnalyticsMetaData {
    #[serde(default)]
    pub items: HashMap<String, MetaItem>,
    #[serde(default)]
    pub pager: Option<Pager>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalyticsResponse {
    #[serde(default)]
    pub headers: Vec<AnalyticsHeader>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default, rename = "metaData")]
    pub meta_data: AnalyticsMetaData,
    #[serde(default)]
    pub pager: Option<Pager>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataValue {
    #[serde(rename = "dataElement")]
    pub data_element: String,
    pub period: String,
    #[serde(rename = "orgUnit")]
    pub org_unit: String,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataValueSetResponse {
    #[serde(default, rename = "dataValues")]
    pub data_values: Vec<DataValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventDataValue {
    #[serde(rename = "dataElement")]
    pub data_element: String,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackerEvent {
    #[serde(default, rename = "occurredAt", alias = "eventDate")]
    pub occurred_at: Option<String>,
    #[serde(rename = "orgUnit")]
    pub org_unit: String,
    #[serde(default, rename = "orgUnitName")]
    pub org_unit_name: Option<String>,
    #[serde(default, rename = "dataValues")]
    pub data_values: Vec<EventDataValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventsResponse {
    #[serde(default, rename = "instances", alias = "events")]
    pub instances: Vec<TrackerEvent>,
    #[serde(default, rename = "pageCount")]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub pager: Option<Pager>,
}

/// A decoded upstream response, one variant per endpoint family.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    Analytics(AnalyticsResponse),
    DataValues(DataValueSetResponse),
    Events(EventsResponse),
}

/// What normalization needs besides the payload itself.
pub struct NormalizeContext<'a> {
    /// Requested indicator ids; event data values outside this set are dropped.
    pub indicators: &'a [String],
    /// Resolved periods, in resolution order.
    pub periods: &'a [Period],
}

impl UpstreamPayload {
    /// Decode a raw JSON body according to its endpoint family.
    pub fn decode(family: EndpointFamily, value: Value) -> Result<Self, BridgeError> {
        let malformed = |message: String| BridgeError::UpstreamMalformed {
            endpoint: family,
            message,
        };
        if !value.is_object() {
            return Err(malformed("expected a JSON object".to_string()));
        }
        let payload = match family {
            EndpointFamily::Analytics => {
                UpstreamPayload::Analytics(serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?)
            }
            EndpointFamily::DataValueSets => {
                UpstreamPayload::DataValues(serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?)
            }
            EndpointFamily::Events => {
                UpstreamPayload::Events(serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?)
            }
            EndpointFamily::GeoFeatures => {
                return Err(malformed("geoFeatures is not a dataset endpoint".to_string()))
            }
        };
        Ok(payload)
    }

    pub fn family(&self) -> EndpointFamily {
        match self {
            UpstreamPayload::Analytics(_) => EndpointFamily::Analytics,
            UpstreamPayload::DataValues(_) => EndpointFamily::DataValueSets,
            UpstreamPayload::Events(_) => EndpointFamily::Events,
        }
    }

    /// Number of pages the upstream reports for this response.
    pub fn page_count(&self) -> u32 {
        match self {
            UpstreamPayload::Analytics(r) => r
                .pager
                .or(r.meta_data.pager)
                .map(|p| p.page_count)
                .unwrap_or(1),
            UpstreamPayload::DataValues(_) => 1,
            UpstreamPayload::Events(r) => r
                .page_count
                .or(r.pager.map(|p| p.page_count))
                .unwrap_or(1),
        }
    }

    /// Number of raw entries (rows, data values, events) in this page.
    pub fn len(&self) -> usize {
        match self {
            UpstreamPayload::Analytics(r) => r.rows.len(),
            UpstreamPayload::DataValues(r) => r.data_values.len(),
            UpstreamPayload::Events(r) => r.instances.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into long-format records.
    pub fn into_records(self, ctx: &NormalizeContext<'_>) -> Result<Vec<LongRecord>, BridgeError> {
        match self {
            UpstreamPayload::Analytics(r) => analytics_records(r),
            UpstreamPayload::DataValues(r) => Ok(r
                .data_values
                .into_iter()
                .map(|dv| {
                    let value = dv.value.as_ref().and_then(parse_value);
                    LongRecord::new(dv.period, dv.org_unit, dv.data_element, value)
                })
                .collect()),
            UpstreamPayload::Events(r) => Ok(event_records(r, ctx)),
        }
    }
}

/// Numeric value of a cell; non-numeric values become null.
fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn analytics_records(response: AnalyticsResponse) -> Result<Vec<LongRecord>, BridgeError> {
    if response.rows.is_empty() {
        return Ok(Vec::new());
    }

    let position = |name: &str| {
        response
            .headers
            .iter()
            .position(|h| h.name == name)
            .ok_or_else(|| BridgeError::UpstreamMalformed {
                endpoint: EndpointFamily::Analytics,
                message: format!("missing '{}' header", name),
            })
    };
    let dx = position("dx")?;
    let pe = position("pe")?;
    let ou = position("ou")?;
    let value = position("value")?;
    let width = dx.max(pe).max(ou).max(value);

    let items = &response.meta_data.items;
    let name_of = |id: &str| items.get(id).and_then(|item| item.name.clone());

    let mut records = Vec::with_capacity(response.rows.len());
    for (i, row) in response.rows.iter().enumerate() {
        if row.len() <= width {
            return Err(BridgeError::UpstreamMalformed {
                endpoint: EndpointFamily::Analytics,
                message: format!("row {} has {} cells, expected at least {}", i, row.len(), width + 1),
            });
        }
        let indicator = cell_text(&row[dx]);
        let org_unit = cell_text(&row[ou]);
        let label = name_of(&indicator).unwrap_or(indicator);
        let mut record = LongRecord::new(cell_text(&row[pe]), org_unit.clone(), label, parse_value(&row[value]));
        if let Some(name) = name_of(&org_unit) {
            record = record.with_org_unit_name(name);
        }
        records.push(record);
    }
    Ok(records)
}

fn event_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn event_records(response: EventsResponse, ctx: &NormalizeContext<'_>) -> Vec<LongRecord> {
    let mut records = Vec::new();
    for event in response.instances {
        let Some(date) = event.occurred_at.as_deref().and_then(event_date) else {
            continue;
        };
        // first resolved period containing the date; events outside all are dropped
        let Some(period) = ctx.periods.iter().find(|p| p.contains(date)) else {
            continue;
        };
        for dv in &event.data_values {
            if !ctx.indicators.is_empty() && !ctx.indicators.contains(&dv.data_element) {
                continue;
            }
            let mut record = LongRecord::new(
                period.to_string(),
                event.org_unit.clone(),
                dv.data_element.clone(),
                dv.value.as_ref().and_then(parse_value),
            );
            if let Some(ref name) = event.org_unit_name {
                record = record.with_org_unit_name(name.clone());
            }
            records.push(record);
        }
    }
    records
}

// ============ Requests ============

/// One slice of the dimension space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub indicators: Vec<String>,
    pub org_units: Vec<String>,
}

/// Split a query into dx-chunk × ou-chunk slices, in list order.
///
/// Event queries filter indicators locally, so only their org units split.
pub fn plan_chunks(query: &QueryDescriptor, max_items: usize) -> Vec<Chunk> {
    let max_items = max_items.max(1);
    let dx_chunks: Vec<&[String]> = if query.endpoint() == EndpointFamily::Events {
        vec![&query.indicators[..]]
    } else {
        query.indicators.chunks(max_items).collect()
    };

    let mut chunks = Vec::new();
    for dx in &dx_chunks {
        for ou in query.org_units.chunks(max_items) {
            chunks.push(Chunk {
                indicators: dx.to_vec(),
                org_units: ou.to_vec(),
            });
        }
    }
    chunks
}

/// Query parameters for one page of one chunk.
pub fn request_params(
    query: &QueryDescriptor,
    periods: &[String],
    chunk: &Chunk,
    page: u32,
    page_size: usize,
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| params.push((k.to_string(), v));

    match query.endpoint() {
        EndpointFamily::Analytics => {
            push("dimension", format!("dx:{}", chunk.indicators.join(";")));
            push("dimension", format!("pe:{}", periods.join(";")));
            push("dimension", format!("ou:{}", chunk.org_units.join(";")));
            if query.org_unit_mode != OrgUnitMode::Selected {
                push("ouMode", query.org_unit_mode.as_str().to_string());
            }
            push("displayProperty", "NAME".to_string());
            push("paging", "true".to_string());
            push("page", page.to_string());
            push("pageSize", page_size.to_string());
        }
        EndpointFamily::DataValueSets => {
            for dx in &chunk.indicators {
                push("dataElement", dx.clone());
            }
            for pe in periods {
                push("period", pe.clone());
            }
            for ou in &chunk.org_units {
                push("orgUnit", ou.clone());
            }
            if query.org_unit_mode != OrgUnitMode::Selected {
                push("children", "true".to_string());
            }
        }
        EndpointFamily::Events => {
            if let Some(ref program) = query.program {
                push("program", program.clone());
            }
            push("orgUnits", chunk.org_units.join(","));
            push("orgUnitMode", query.org_unit_mode.as_str().to_string());
            if let Some((start, end)) = date_span(periods) {
                push("occurredAfter", start.format("%Y-%m-%d").to_string());
                push("occurredBefore", end.format("%Y-%m-%d").to_string());
            }
            push("fields", "occurredAt,orgUnit,orgUnitName,dataValues[dataElement,value]".to_string());
            push("totalPages", "true".to_string());
            push("page", page.to_string());
            push("pageSize", page_size.to_string());
        }
        EndpointFamily::GeoFeatures => {}
    }
    params
}

async fn fetch_chunk(
    upstream: Arc<dyn Upstream>,
    query: &QueryDescriptor,
    periods: &[String],
    parsed_periods: &[Period],
    chunk: Chunk,
    page_size: usize,
) -> Result<Vec<LongRecord>, BridgeError> {
    let family = query.endpoint();
    let ctx = NormalizeContext {
        indicators: &chunk.indicators,
        periods: parsed_periods,
    };

    let mut records = Vec::new();
    let mut page = 1u32;
    loop {
        let params = request_params(query, periods, &chunk, page, page_size);
        let body = upstream.get_json(family, family.path(), &params).await?;
        let payload = UpstreamPayload::decode(family, body)?;
        let page_count = payload.page_count();
        let entries = payload.len();
        tracing::debug!(endpoint = %family, page, page_count, entries, "fetched page");

        records.extend(payload.into_records(&ctx)?);

        let more = match family {
            EndpointFamily::DataValueSets => false,
            // tracker pages without a count end on a short page
            EndpointFamily::Events if page_count <= 1 => entries >= page_size && entries > 0,
            _ => page < page_count,
        };
        if !more {
            break;
        }
        page += 1;
    }
    Ok(records)
}

async fn fetch_all(
    upstream: Arc<dyn Upstream>,
    query: &QueryDescriptor,
    periods: &[String],
    options: &FetchOptions,
) -> Result<Vec<LongRecord>, BridgeError> {
    let parsed_periods: Vec<Period> = periods.iter().filter_map(|c| Period::parse_code(c)).collect();
    let chunks = plan_chunks(query, options.max_dimension_items);
    tracing::info!(
        endpoint = %query.endpoint(),
        chunks = chunks.len(),
        periods = periods.len(),
        "fetching {}",
        query.summary()
    );

    let parsed = &parsed_periods;
    let per_chunk = stream::iter(chunks)
        .map(|chunk| fetch_chunk(upstream.clone(), query, periods, parsed, chunk, options.page_size))
        .buffered(options.max_concurrency.max(1))
        .try_collect::<Vec<Vec<LongRecord>>>()
        .await?;

    Ok(per_chunk.into_iter().flatten().collect())
}

/// Fetch every record a query addresses.
///
/// `periods` are the query's resolved period codes. Returns an empty vector
/// when the upstream answers successfully with no data.
///
/// # Errors
///
/// - [`BridgeError::UpstreamUnavailable`] / [`BridgeError::UpstreamMalformed`]
///   from any chunk (the first failure aborts the rest).
/// - [`BridgeError::Cancelled`] when `cancel` fires.
/// - [`BridgeError::DeadlineExceeded`] when `options.deadline` elapses.
pub async fn fetch_records(
    upstream: Arc<dyn Upstream>,
    query: &QueryDescriptor,
    periods: &[String],
    options: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<Vec<LongRecord>, BridgeError> {
    if cancel.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }
    let work = tokio::time::timeout(options.deadline, fetch_all(upstream, query, periods, options));
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::warn!("query cancelled; discarding partial results");
            Err(BridgeError::Cancelled)
        }
        result = work => match result {
            Ok(records) => records,
            Err(_) => {
                tracing::warn!(deadline_secs = options.deadline.as_secs(), "query deadline exceeded");
                Err(BridgeError::DeadlineExceeded)
            }
        },
    }
}
