//! HTTP adapter for the query-serving stage.
//!
//! Endpoints:
//! - `GET /search?q=<text>&k=<n>&candidates=<n>`
//! - `GET /health`
//! - `GET /metrics` (Prometheus text format, when a recorder is installed)

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::Error;
use crate::search::{QueryEngine, ResultItem, SearchRequest};

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_address: String,
    pub cors_enabled: bool,
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub default_k: usize,
    pub default_candidate_pool: usize,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    k: Option<usize>,
    candidates: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    k: usize,
    results: Vec<ResultItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub index: String,
    pub documents: u64,
    pub uptime: u64,
}

/// Error body returned by the API.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidQuery(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::IndexNotFound(_) => StatusCode::NOT_FOUND,
            Error::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let k = params.k.unwrap_or(state.default_k);
    let request = SearchRequest::new(params.q)
        .with_k(k)
        .with_candidate_pool(params.candidates.unwrap_or(state.default_candidate_pool.max(k)));
    let results = state.engine.search(&request).await?;
    Ok(Json(SearchResponse {
        query: request.text,
        k,
        results,
    }))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let documents = state.engine.document_count().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index: state.engine.index_name().to_string(),
        documents,
        uptime: state.start_time.elapsed().as_secs(),
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Build the router.
pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/search", get(search))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// HTTP server wrapping the query engine.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> crate::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address).await?;
        info!(address = %self.config.listen_address, "API server listening");
        axum::serve(listener, router(self.state, self.config.cors_enabled)).await?;
        Ok(())
    }
}
