//! HTTP server.
//!
//! Exposes the dataset pipeline, column reconciliation and the boundary
//! cache as a JSON API for the host's dataset registry and map renderer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/query` | Run a descriptor, optionally projected by references |
//! | `POST` | `/columns` | Column metadata for a descriptor |
//! | `POST` | `/reconcile` | Map host references onto dataset column names |
//! | `GET`  | `/boundaries` | Corrected boundaries (`?level=2` or `?levels=2,3`, `&format=geojson`) |
//! | `POST` | `/cache/invalidate` | Drop boundary entries by version prefix |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_dimension", "message": "query dimension 'ou' must not be empty" } }
//! ```
//!
//! Local validation errors are `400`, upstream failures `502`, deadline
//! `504`, cancellation `408`, and internal faults `500`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};

use dhis2_bridge_core::models::DatasetColumn;
use dhis2_bridge_core::reconcile::{ColumnFilter, QueryReferences};
use dhis2_bridge_core::store::parse_level_key;
use dhis2_bridge_core::BridgeError;

use crate::app::App;
use crate::cache::InvalidateReport;
use crate::config::Config;
use crate::dataset::{today, QueryResult};

/// Starts the HTTP server on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = App::from_config(config).await?;
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    axum::serve(listener, router(Arc::new(app))).await?;

    Ok(())
}

/// Build the router around an application context.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/columns", post(handle_columns))
        .route("/reconcile", post(handle_reconcile))
        .route("/boundaries", get(handle_boundaries))
        .route("/cache/invalidate", post(handle_invalidate))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

pub fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::EmptyDimension { .. }
        | BridgeError::InvalidPeriodExpression { .. }
        | BridgeError::InvalidDescriptor { .. }
        | BridgeError::UnknownColumn { .. } => StatusCode::BAD_REQUEST,
        BridgeError::UpstreamUnavailable { .. } | BridgeError::UpstreamMalformed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        BridgeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        BridgeError::InvalidGeometry { .. } | BridgeError::ColumnCollision { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        AppError {
            status: status_for(&err),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn parse_reference_date(raw: Option<&str>) -> Result<NaiveDate, AppError> {
    match raw {
        None => Ok(today()),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| bad_request(format!("referenceDate must be YYYY-MM-DD (got '{}')", s))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

/// A token cancelled when the returned guard drops. Handlers keep the guard
/// alive for the request, so a client disconnect (which drops the handler
/// future) cancels the fetch.
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    descriptor: String,
    #[serde(default)]
    reference_date: Option<String>,
    #[serde(default)]
    group_by: Vec<String>,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    filters: Vec<ColumnFilter>,
}

async fn handle_query(
    State(app): State<Arc<App>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    let reference = parse_reference_date(req.reference_date.as_deref())?;
    let refs = QueryReferences {
        group_by: req.group_by,
        metrics: req.metrics,
        filters: req.filters,
    };
    let (cancel, _guard) = request_token();
    let result = app
        .pipeline
        .run_raw(&req.descriptor, reference, &refs, &cancel)
        .await?;
    Ok(Json(result))
}

// ============ POST /columns ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnsRequest {
    descriptor: String,
    #[serde(default)]
    reference_date: Option<String>,
}

#[derive(Serialize)]
struct ColumnsResponse {
    columns: Vec<DatasetColumn>,
}

async fn handle_columns(
    State(app): State<Arc<App>>,
    Json(req): Json<ColumnsRequest>,
) -> Result<Json<ColumnsResponse>, AppError> {
    let reference = parse_reference_date(req.reference_date.as_deref())?;
    let (cancel, _guard) = request_token();
    let columns = app
        .pipeline
        .columns(&req.descriptor, reference, &cancel)
        .await?;
    Ok(Json(ColumnsResponse { columns }))
}

// ============ POST /reconcile ============

/// Either `columns` (already known) or `descriptor` (introspected) must be
/// given.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileRequest {
    #[serde(default)]
    columns: Option<Vec<DatasetColumn>>,
    #[serde(default)]
    descriptor: Option<String>,
    #[serde(default)]
    reference_date: Option<String>,
    references: QueryReferences,
    /// Fail on references that match no column.
    #[serde(default)]
    strict: bool,
}

#[derive(Serialize)]
struct ReconcileResponse {
    references: QueryReferences,
}

async fn handle_reconcile(
    State(app): State<Arc<App>>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let columns = match (req.columns, req.descriptor) {
        (Some(columns), _) => columns,
        (None, Some(descriptor)) => {
            let reference = parse_reference_date(req.reference_date.as_deref())?;
            let (cancel, _guard) = request_token();
            app.pipeline.columns(&descriptor, reference, &cancel).await?
        }
        (None, None) => return Err(bad_request("either columns or descriptor is required")),
    };

    let references = if req.strict {
        req.references.resolve(&columns)?
    } else {
        req.references.reconcile(&columns)
    };
    Ok(Json(ReconcileResponse { references }))
}

// ============ GET /boundaries ============

#[derive(Deserialize)]
struct BoundaryParams {
    #[serde(default)]
    level: Option<u32>,
    #[serde(default)]
    levels: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

async fn handle_boundaries(
    State(app): State<Arc<App>>,
    Query(params): Query<BoundaryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let levels = match (params.level, params.levels.as_deref()) {
        (Some(level), None) => vec![level],
        (None, Some(raw)) => parse_level_key(raw)
            .ok_or_else(|| bad_request(format!("levels must be a comma-separated list of integers (got '{}')", raw)))?,
        (Some(_), Some(_)) => return Err(bad_request("give either level or levels, not both")),
        (None, None) => return Err(bad_request("level or levels is required")),
    };

    let entry = app
        .cache
        .get_or_fetch(&levels, app.cache_version())
        .await?;

    let body = match params.format.as_deref() {
        Some("geojson") => entry.collection.to_geojson(),
        None | Some("json") => serde_json::to_value(entry.as_ref())
            .map_err(|e| internal(format!("failed to serialize boundaries: {}", e)))?,
        Some(other) => return Err(bad_request(format!("unknown format '{}'", other))),
    };
    Ok(Json(body))
}

// ============ POST /cache/invalidate ============

#[derive(Deserialize)]
struct InvalidateRequest {
    prefix: String,
}

async fn handle_invalidate(
    State(app): State<Arc<App>>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateReport>, AppError> {
    let report = app
        .cache
        .invalidate(&req.prefix)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhis2_bridge_core::models::{Dimension, EndpointFamily};

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&BridgeError::EmptyDimension {
                which: Dimension::Periods
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BridgeError::UpstreamUnavailable {
                endpoint: EndpointFamily::Analytics,
                summary: String::new(),
                cause: "HTTP 503".to_string(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&BridgeError::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&BridgeError::Cancelled), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_request_token_cancelled_on_drop() {
        let (token, guard) = request_token();
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reference_date_parsing() {
        assert_eq!(
            parse_reference_date(Some("2025-06-15")).ok(),
            NaiveDate::from_ymd_opt(2025, 6, 15)
        );
        assert!(parse_reference_date(Some("15/06/2025")).is_err());
    }
}
