//! HTTP surface for the analysis workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/process` | Run a general analysis |
//! | `POST` | `/api/analyze-specialized` | Run a risk / compliance analysis |
//! | `GET`  | `/api/matrices/{request_id}` | Read a stored matrix back |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The verified caller identity arrives in the `x-caller-id` header, set by
//! the authentication layer in front of this server.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_request", "message": "prompt must not be empty" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_request` | 400 |
//! | `unauthenticated` | 401 |
//! | `not_found` | 404 |
//! | `timeout` | 408 |
//! | `no_fields_derived` | 422 |
//! | `cancelled` | 499 |
//! | `persistence_failure` | 500 (body also carries the computed matrix) |
//! | `retrieval_failure` | 502 |
//!
//! # Cancellation
//!
//! Each analysis handler owns a [`CancellationToken`] behind a drop guard.
//! When the client disconnects the handler future is dropped, the guard
//! fires, and the running request is aborted.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use clause_matrix_core::error::AnalysisError;
use clause_matrix_core::models::{
    AnalysisOutcome, AnalysisRequest, AnalysisType, ExtractionRecord, PassMetadata,
};

use crate::config::Config;
use crate::workflow::Orchestrator;

/// Header carrying the authenticated caller id.
pub const CALLER_HEADER: &str = "x-caller-id";

#[derive(Clone)]
struct AppState {
    engine: Arc<Orchestrator>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Orchestrator::from_config(config).await?);
    run_server_with_engine(engine, &config.server.bind).await
}

/// Starts the server around an already-built orchestrator.
pub async fn run_server_with_engine(engine: Arc<Orchestrator>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(engine);

    tracing::info!(bind = bind_addr, "analysis server listening");
    println!("Analysis server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full route table, with permissive CORS.
pub fn router(engine: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/process", post(handle_process))
        .route("/api/analyze-specialized", post(handle_specialized))
        .route("/api/matrices/{request_id}", get(handle_get_matrix))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<AnalysisResponse>,
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
    data: Option<AnalysisResponse>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
            data: self.data,
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthenticated() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthenticated".to_string(),
        message: format!("missing {} header", CALLER_HEADER),
        data: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        data: None,
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
        data: None,
    }
}

/// Malformed or incomplete request bodies.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request".to_string(),
            message: rejection.body_text(),
            data: None,
        }
    }
}

impl From<AnalysisError> for AppError {
    fn from(err: AnalysisError) -> Self {
        let status = match &err {
            AnalysisError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            AnalysisError::NoFieldsDerived { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AnalysisError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AnalysisError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            AnalysisError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            AnalysisError::RetrievalFailure(_) => StatusCode::BAD_GATEWAY,
            AnalysisError::PersistenceFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            data: err.partial_outcome().map(AnalysisResponse::from_outcome),
        }
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

// ============ POST /api/process, /api/analyze-specialized ============

#[derive(Deserialize)]
struct AnalyzeBody {
    prompt: String,
    #[serde(default)]
    analysis_type: AnalysisType,
}

/// Response body for both analysis endpoints.
///
/// `data` maps document name → field name → cell.
#[derive(Serialize)]
struct AnalysisResponse {
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis_type: Option<AnalysisType>,
    query_intent: String,
    columns: Vec<String>,
    data: BTreeMap<String, BTreeMap<String, ExtractionRecord>>,
    documents_analyzed: usize,
    metadata: PassMetadata,
}

impl AnalysisResponse {
    fn from_outcome(outcome: &AnalysisOutcome) -> Self {
        let analysis_type =
            (outcome.analysis_type != AnalysisType::General).then_some(outcome.analysis_type);
        Self {
            request_id: outcome.request_id.clone(),
            analysis_type,
            query_intent: outcome.query_intent.clone(),
            columns: outcome.matrix.columns.clone(),
            data: outcome.matrix.rows.clone(),
            documents_analyzed: outcome.metadata.documents_analyzed,
            metadata: outcome.metadata.clone(),
        }
    }
}

fn caller_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn analyze(
    engine: &Orchestrator,
    headers: &HeaderMap,
    prompt: String,
    analysis_type: AnalysisType,
) -> Result<Json<AnalysisResponse>, AppError> {
    let request = AnalysisRequest {
        prompt,
        analysis_type,
        caller_id: caller_id(headers),
    };

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = engine.run_analysis(request, cancel).await?;
    Ok(Json(AnalysisResponse::from_outcome(&outcome)))
}

/// General analysis. The body's `analysis_type`, if any, is ignored.
async fn handle_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Result<Json<AnalysisResponse>, AppError> {
    let Json(body) = body?;
    analyze(&state.engine, &headers, body.prompt, AnalysisType::General).await
}

async fn handle_specialized(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Result<Json<AnalysisResponse>, AppError> {
    let Json(body) = body?;
    analyze(&state.engine, &headers, body.prompt, body.analysis_type).await
}

// ============ GET /api/matrices/{request_id} ============

#[derive(Serialize)]
struct StoredMatrixResponse {
    request_id: String,
    status: String,
    prompt: String,
    analysis_type: AnalysisType,
    retry_count: u32,
    columns: Vec<String>,
    data: BTreeMap<String, BTreeMap<String, ExtractionRecord>>,
}

async fn handle_get_matrix(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<StoredMatrixResponse>, AppError> {
    let caller = caller_id(&headers).ok_or_else(unauthenticated)?;
    let (record, matrix) = state
        .engine
        .load_matrix(&request_id, &caller)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("no analysis with id: {}", request_id)))?;

    Ok(Json(StoredMatrixResponse {
        request_id: record.request_id,
        status: record.status.as_str().to_string(),
        prompt: record.prompt,
        analysis_type: record.analysis_type,
        retry_count: record.retry_count,
        columns: matrix.columns,
        data: matrix.rows,
    }))
}
