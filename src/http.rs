use crate::changeset::ChangeSet;
use crate::errors::{AppError, AppResult};
use crate::models::{HealthResponse, MappingItems, MetricType, MetricsBundle, OkResponse, UnitOfMeasure};
use crate::service::MetricsService;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

const LOAD_FAILED: &str = "Failed to load use case metrics.";
const UPDATE_FAILED: &str = "Failed to update use case metrics.";
const MAPPINGS_FAILED: &str = "Failed to load reference data.";

#[derive(Clone)]
pub struct AppState {
    pub service: MetricsService,
}

pub fn build_router(service: MetricsService) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/usecases/:id/metrics",
            get(get_use_case_metrics).patch(patch_use_case_metrics),
        )
        .route("/api/mappings/metric-categories", get(list_metric_categories))
        .route("/api/mappings/unit-of-measure", get(list_units_of_measure))
        .layer(middleware::map_response(no_store))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_use_case_metrics(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<MetricsBundle>, ApiError> {
    let use_case_id = parse_use_case_id(&raw_id).map_err(ApiError::context(LOAD_FAILED))?;
    let service = state.service.clone();
    let bundle = run_blocking(move || service.fetch_metrics(use_case_id))
        .await
        .map_err(ApiError::context(LOAD_FAILED))?;
    Ok(Json(bundle))
}

async fn patch_use_case_metrics(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Result<Json<OkResponse>, ApiError> {
    let use_case_id = parse_use_case_id(&raw_id).map_err(ApiError::context(UPDATE_FAILED))?;
    let change_set = decode_change_set(&body).map_err(ApiError::context(UPDATE_FAILED))?;
    let service = state.service.clone();
    run_blocking(move || service.apply_changes(use_case_id, &change_set))
        .await
        .map_err(ApiError::context(UPDATE_FAILED))?;
    Ok(Json(OkResponse { ok: true }))
}

async fn list_metric_categories(State(state): State<AppState>) -> Result<Json<MappingItems<MetricType>>, ApiError> {
    let service = state.service.clone();
    let items = run_blocking(move || service.metric_types())
        .await
        .map_err(ApiError::context(MAPPINGS_FAILED))?;
    Ok(Json(MappingItems { items }))
}

async fn list_units_of_measure(State(state): State<AppState>) -> Result<Json<MappingItems<UnitOfMeasure>>, ApiError> {
    let service = state.service.clone();
    let items = run_blocking(move || service.units_of_measure())
        .await
        .map_err(ApiError::context(MAPPINGS_FAILED))?;
    Ok(Json(MappingItems { items }))
}

async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn parse_use_case_id(raw: &str) -> AppResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| AppError::ClientInput("Invalid id".to_string()))
}

fn decode_change_set(body: &[u8]) -> AppResult<ChangeSet> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|error| AppError::ClientInput(format!("Invalid JSON body: {}", error)))?;
    ChangeSet::from_json(value)
}

/// SQLite calls block; keep them off the async workers.
async fn run_blocking<T, F>(work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AppError::Internal(format!("blocking task failed: {}", error)))?
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

/// An `AppError` paired with the message shown when the failure is ours rather than the caller's.
#[derive(Debug)]
pub struct ApiError {
    error: AppError,
    server_message: &'static str,
}

impl ApiError {
    fn context(server_message: &'static str) -> impl Fn(AppError) -> Self {
        move |error| Self { error, server_message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.error {
            AppError::ClientInput(message) => (StatusCode::BAD_REQUEST, ErrorBody { message, errors: None }),
            AppError::NoChanges => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    message: "No changes provided.".to_string(),
                    errors: None,
                },
            ),
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    message: "Validation failed.".to_string(),
                    errors: Some(errors),
                },
            ),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, ErrorBody { message, errors: None }),
            error @ (AppError::Persistence(_) | AppError::Io(_) | AppError::Internal(_)) => {
                tracing::error!(error = %error, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        message: self.server_message.to_string(),
                        errors: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
