// SCD Merge - read-only JSON API over the dimension tables

use crate::attributes::EntityId;
use crate::config::parse_as_of;
use crate::dimension::{DimensionRegistry, DimensionSpec};
use crate::error::MergeError;
use crate::orchestrator::RunReport;
use crate::query;
use crate::store::{DimensionStore, SqliteStore};
use crate::temporal::{format_ts, DimensionRow, InvariantReport};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<SqliteStore>>,
    registry: Arc<DimensionRegistry>,
}

impl AppState {
    pub fn new(store: SqliteStore, registry: DimensionRegistry) -> Self {
        AppState {
            store: Arc::new(Mutex::new(store)),
            registry: Arc::new(registry),
        }
    }

    fn store(&self) -> Result<MutexGuard<'_, SqliteStore>, ApiError> {
        self.store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned"))
    }

    fn dimension(&self, name: &str) -> Result<&DimensionSpec, ApiError> {
        self.registry.get(name).map_err(ApiError::from)
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<MergeError> for ApiError {
    fn from(err: MergeError) -> Self {
        let status = match &err {
            MergeError::UnknownDimension(_) => StatusCode::NOT_FOUND,
            MergeError::Config(_) | MergeError::Extract(_) | MergeError::TypeMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            MergeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct DimensionSummary {
    name: String,
    table: String,
    key: String,
    tracked: Vec<String>,
    passthrough: Vec<String>,
    current_rows: Option<usize>,
}

#[derive(Serialize)]
struct RowsResponse {
    dimension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    as_of: Option<String>,
    count: usize,
    rows: Vec<DimensionRow>,
}

#[derive(Serialize)]
struct HistoryResponse {
    dimension: String,
    id: EntityId,
    versions: Vec<DimensionRow>,
}

#[derive(Deserialize)]
pub struct AsOfParams {
    t: String,
}

#[derive(Deserialize)]
pub struct RunsParams {
    dimension: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/dimensions - Registered dimensions with their current row counts
async fn list_dimensions(State(state): State<AppState>) -> ApiResult<Vec<DimensionSummary>> {
    let store = state.store()?;

    let summaries = state
        .registry
        .all()
        .map(|spec| DimensionSummary {
            name: spec.name.clone(),
            table: spec.table.clone(),
            key: spec.key.clone(),
            tracked: spec.tracked.iter().map(|a| a.name.clone()).collect(),
            passthrough: spec.passthrough.iter().map(|a| a.name.clone()).collect(),
            // Dimensions never merged have no table yet
            current_rows: store.current_rows(spec).ok().map(|rows| rows.len()),
        })
        .collect();

    Ok(Json(ApiResponse::ok(summaries)))
}

/// GET /api/dimensions/:name/current - Current snapshot
async fn current_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<RowsResponse> {
    let spec = state.dimension(&name)?;
    let rows = query::current_snapshot(&*state.store()?, spec)?;

    Ok(Json(ApiResponse::ok(RowsResponse {
        dimension: name,
        as_of: None,
        count: rows.len(),
        rows,
    })))
}

/// GET /api/dimensions/:name/as-of?t=... - Point-in-time snapshot
async fn rows_as_of(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<AsOfParams>,
) -> ApiResult<RowsResponse> {
    let spec = state.dimension(&name)?;
    let at = parse_as_of(&params.t).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let rows = query::snapshot_at(&*state.store()?, spec, at)?;

    Ok(Json(ApiResponse::ok(RowsResponse {
        dimension: name,
        as_of: Some(format_ts(&at)),
        count: rows.len(),
        rows,
    })))
}

/// GET /api/dimensions/:name/history/:id - Every version of one identifier
async fn history(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<HistoryResponse> {
    let spec = state.dimension(&name)?;
    let id = EntityId::new(id);
    let timeline = query::entity_history(&*state.store()?, spec, &id)?;

    Ok(Json(ApiResponse::ok(HistoryResponse {
        dimension: name,
        id,
        versions: timeline.history().to_vec(),
    })))
}

/// GET /api/dimensions/:name/verify - Invariant check
async fn verify(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<InvariantReport> {
    let spec = state.dimension(&name)?;
    let report = query::verify_dimension(&*state.store()?, spec)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/runs - Run log, newest first
async fn runs(
    State(state): State<AppState>,
    Query(params): Query<RunsParams>,
) -> ApiResult<Vec<RunReport>> {
    let runs = state.store()?.runs(params.dimension.as_deref())?;
    Ok(Json(ApiResponse::ok(runs)))
}

/// Build the /api router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/dimensions", get(list_dimensions))
        .route("/dimensions/:name/current", get(current_rows))
        .route("/dimensions/:name/as-of", get(rows_as_of))
        .route("/dimensions/:name/history/:id", get(history))
        .route("/dimensions/:name/verify", get(verify))
        .route("/runs", get(runs))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::EntityRecord;
    use crate::orchestrator::MergeOrchestrator;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = DimensionRegistry::new();
        let spec = registry.get("store").unwrap().clone();
        let mut store = SqliteStore::open_in_memory().unwrap();

        for (month, manager) in [(1, "Jo Bloggs"), (4, "Sam Smith")] {
            let record = EntityRecord::new(1)
                .with("store_name", "London Store")
                .with("manager", manager)
                .with_passthrough("opened_date", chrono::NaiveDate::from_ymd_opt(2018, 3, 1).unwrap());
            MergeOrchestrator::new(&mut store, spec.clone())
                .with_as_of(Utc.with_ymd_and_hms(2025, month, 1, 0, 0, 0).unwrap())
                .run(vec![record], None)
                .unwrap();
        }

        create_router(AppState::new(store, registry))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_current_and_as_of() {
        let (status, body) = get_json(app(), "/api/dimensions/store/current").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["data"]["rows"][0]["tracked"]["manager"], "Sam Smith");

        let (status, body) = get_json(app(), "/api/dimensions/store/as-of?t=2025-02-15").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["rows"][0]["tracked"]["manager"], "Jo Bloggs");
    }

    #[tokio::test]
    async fn test_history_and_runs() {
        let (_, body) = get_json(app(), "/api/dimensions/store/history/1").await;
        assert_eq!(body["data"]["versions"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(app(), "/api/runs?dimension=store").await;
        let runs = body["data"].as_array().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0]["state"], "COMPLETE");
    }

    #[tokio::test]
    async fn test_errors() {
        let (status, body) = get_json(app(), "/api/dimensions/transaction/current").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = get_json(app(), "/api/dimensions/store/as-of?t=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
