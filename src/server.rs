//! JSON HTTP API over a [`Monitor`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Storage and summarizer checks, 503 when unhealthy |
//! | `POST` | `/fetch` | Run a fetch cycle |
//! | `GET`  | `/diffs` | Newest diff per document (`?has_changes_only=true`) |
//! | `POST` | `/diffs` | Run a batch diff cycle |
//! | `GET`  | `/documents` | List documents with current/last/prev pointers |
//! | `GET`  | `/documents/{id}` | Document detail, snapshot and diff history |
//! | `GET`  | `/documents/{id}/snapshots/{selector}` | Snapshot content and metadata |
//! | `POST` | `/documents/{id}/diff` | Request a diff |
//! | `GET`  | `/documents/{id}/diffs` | Diff history |
//! | `GET`  | `/documents/{id}/diffs/latest` | Most recently generated diff |
//! | `GET`  | `/documents/{id}/diffs/{from}/{to}` | Diff for a snapshot pair |
//!
//! `{selector}`, `{from}` and `{to}` accept `current`, `last`, `prev`, a
//! `YYYY-MM-DD` date or a snapshot timestamp.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `conflict` | 409 |
//! | `fetch_error`, `summarization_error` | 502 |
//! | `config_error`, `storage_error` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::diff::DiffRequest;
use crate::error::MonitorError;
use crate::models::{DiffMeta, DiffRecord, Selector, Snapshot};
use crate::monitor::{
    CycleReport, DiffOverview, DocumentDetail, DocumentOverview, HealthReport, Monitor, Scope,
};

#[derive(Clone)]
struct AppState {
    monitor: Arc<Monitor>,
}

/// Build the API router around `monitor`.
pub fn router(monitor: Arc<Monitor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/fetch", post(handle_fetch))
        .route("/diffs", get(handle_diff_overview).post(handle_diff_cycle))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{id}", get(handle_describe_document))
        .route("/documents/{id}/snapshots/{selector}", get(handle_get_snapshot))
        .route("/documents/{id}/diff", post(handle_generate_diff))
        .route("/documents/{id}/diffs", get(handle_list_diffs))
        .route("/documents/{id}/diffs/latest", get(handle_latest_diff))
        .route("/documents/{id}/diffs/{from}/{to}", get(handle_diff_pair))
        .layer(cors)
        .with_state(AppState { monitor })
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let monitor = Arc::new(Monitor::from_config(config)?);
    let app = router(monitor);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "HTTP server listening");
    println!("tosmon listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
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

impl From<MonitorError> for AppError {
    fn from(err: MonitorError) -> Self {
        let status = match &err {
            MonitorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::Conflict(_) => StatusCode::CONFLICT,
            MonitorError::Fetch(_) | MonitorError::Summarization(_) => StatusCode::BAD_GATEWAY,
            MonitorError::Config(_) | MonitorError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn parse_selector(raw: &str) -> Result<Selector, AppError> {
    raw.parse::<Selector>().map_err(AppError::from)
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.monitor.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// ============ Cycles ============

#[derive(Debug, Default, Deserialize)]
struct FetchBody {
    #[serde(default)]
    document_ids: Vec<String>,
    #[serde(default)]
    force_update: bool,
}

/// Handler for `POST /fetch`. The body is optional; without one every
/// configured document is fetched.
async fn handle_fetch(
    State(state): State<AppState>,
    body: Option<Json<FetchBody>>,
) -> Result<Json<CycleReport>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let report = state
        .monitor
        .run_fetch_cycle(&Scope::new(body.document_ids), body.force_update)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
struct DiffCycleBody {
    #[serde(default)]
    document_ids: Vec<String>,
    #[serde(default)]
    force_regenerate: bool,
}

#[derive(Debug, Default, Deserialize)]
struct OverviewQuery {
    #[serde(default)]
    has_changes_only: bool,
}

#[derive(Serialize)]
struct DiffOverviewResponse {
    document_count: usize,
    documents: Vec<DiffOverview>,
}

async fn handle_diff_overview(
    State(state): State<AppState>,
    Query(query): Query<OverviewQuery>,
) -> Result<Json<DiffOverviewResponse>, AppError> {
    let documents = state.monitor.diff_overview(query.has_changes_only).await?;
    Ok(Json(DiffOverviewResponse {
        document_count: documents.len(),
        documents,
    }))
}

async fn handle_diff_cycle(
    State(state): State<AppState>,
    body: Option<Json<DiffCycleBody>>,
) -> Result<Json<CycleReport>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let report = state
        .monitor
        .run_diff_cycle(&Scope::new(body.document_ids), body.force_regenerate)
        .await?;
    Ok(Json(report))
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentOverview>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.monitor.list_documents().await?;
    Ok(Json(DocumentListResponse { documents }))
}

async fn handle_describe_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentDetail>, AppError> {
    Ok(Json(state.monitor.describe_document(&id).await?))
}

async fn handle_get_snapshot(
    State(state): State<AppState>,
    Path((id, selector)): Path<(String, String)>,
) -> Result<Json<Snapshot>, AppError> {
    let selector = parse_selector(&selector)?;
    Ok(Json(state.monitor.get_snapshot(&id, selector).await?))
}

// ============ Diffs ============

#[derive(Debug, Default, Deserialize)]
struct DiffBody {
    from: Option<String>,
    to: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct DiffResponse {
    cached: bool,
    diff: DiffRecord,
}

async fn handle_generate_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DiffBody>>,
) -> Result<Json<DiffResponse>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let request = DiffRequest {
        from: body.from.as_deref().map(parse_selector).transpose()?,
        to: body.to.as_deref().map(parse_selector).transpose()?,
        force: body.force,
    };
    let outcome = state.monitor.generate_diff(&id, &request).await?;
    Ok(Json(DiffResponse {
        cached: outcome.was_cached(),
        diff: outcome.into_record(),
    }))
}

#[derive(Serialize)]
struct DiffListResponse {
    diffs: Vec<DiffMeta>,
}

async fn handle_list_diffs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiffListResponse>, AppError> {
    let diffs = state.monitor.list_diffs(&id).await?;
    Ok(Json(DiffListResponse { diffs }))
}

async fn handle_latest_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiffRecord>, AppError> {
    Ok(Json(state.monitor.get_diff(&id, None).await?))
}

async fn handle_diff_pair(
    State(state): State<AppState>,
    Path((id, from, to)): Path<(String, String, String)>,
) -> Result<Json<DiffRecord>, AppError> {
    let pair = (parse_selector(&from)?, parse_selector(&to)?);
    Ok(Json(state.monitor.get_diff(&id, Some(pair)).await?))
}
