//! HTTP API over a single archive.
//!
//! The archive is opened once at startup and shared with every handler
//! through Axum's `State` extractor.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Endpoint listing |
//! | `GET`  | `/search?q=&limit=&workspace=&tags=&mode=` | Search the archive |
//! | `GET`  | `/stats` | Archive statistics |
//! | `GET`  | `/health` | Health check |
//! | `POST` | `/research` | Deep research: `{query, top_k?, model?}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Query parameter 'q' is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `internal` (500), `upstream_error` (502), `not_configured` (503),
//! `unavailable` (503).

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::archive::NotionArchive;
use crate::models::{ArchiveStats, SearchFilters, SearchResult};
use crate::research::{self, ResearchError, ResearchOptions};
use crate::search::SearchMode;

#[derive(Clone)]
pub struct AppState {
    pub archive: Arc<NotionArchive>,
}

/// Serve the archive on `[server].bind` until the process is terminated.
pub async fn run_server(archive: NotionArchive) -> anyhow::Result<()> {
    let bind_addr = archive.config().server.bind.clone();
    let app = router(AppState {
        archive: Arc::new(archive),
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "notion archive API listening");
    println!("Notion Archive API listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/search", get(handle_search))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .route("/research", post(handle_research))
        .layer(cors)
        .with_state(state)
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
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(err: anyhow::Error) -> AppError {
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        format!("{:#}", err),
    )
}

fn classify_search_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("requires embeddings") {
        AppError::new(StatusCode::BAD_REQUEST, "embeddings_disabled", msg)
    } else {
        internal(err)
    }
}

impl From<ResearchError> for AppError {
    fn from(err: ResearchError) -> Self {
        let message = err.to_string();
        match err {
            ResearchError::InvalidRequest(_) => bad_request(message),
            ResearchError::Configuration(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "not_configured", message)
            }
            ResearchError::DependencyMissing(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            ResearchError::Protocol { .. }
            | ResearchError::Transport(_)
            | ResearchError::Api { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            ResearchError::Retrieval(e) => internal(e),
        }
    }
}

// ============ GET / ============

async fn handle_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Notion Archive API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /search": "Search the archive. Params: q (query), limit (default 10), workspace, tags (comma-separated), mode",
            "GET /stats": "Archive statistics",
            "GET /health": "Health check",
            "POST /research": "Deep research grounded in the archive. Body: {query, top_k?, model?}"
        },
        "example": "/search?q=meeting notes&limit=5&workspace=Engineering"
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    archive_initialized: bool,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        archive_initialized: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
    workspace: Option<String>,
    /// Comma-separated.
    tags: Option<String>,
    mode: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
    count: usize,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(bad_request("Query parameter 'q' is required"));
    }

    let config = state.archive.config();
    let limit = params.limit.unwrap_or(config.retrieval.default_limit);
    let mode = match params.mode.as_deref() {
        Some(m) => m.parse::<SearchMode>().map_err(|e| bad_request(e.to_string()))?,
        None => SearchMode::default_for(config),
    };
    let filters = SearchFilters {
        workspace: params.workspace.filter(|w| !w.is_empty()),
        tags: split_tags(params.tags.as_deref()),
    };

    let results = state
        .archive
        .search_with_mode(&query, limit, &filters, mode)
        .await
        .map_err(classify_search_error)?;

    Ok(Json(SearchResponse {
        count: results.len(),
        query,
        results,
    }))
}

/// Split a comma-separated tag list, dropping blanks.
pub fn split_tags(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<ArchiveStats>, AppError> {
    let stats = state.archive.get_stats().await.map_err(internal)?;
    Ok(Json(stats))
}

// ============ POST /research ============

#[derive(Deserialize)]
struct ResearchBody {
    query: String,
    top_k: Option<usize>,
    model: Option<String>,
}

#[derive(Serialize)]
struct ResearchResponse {
    query: String,
    report: String,
}

async fn handle_research(
    State(state): State<AppState>,
    body: Result<Json<ResearchBody>, JsonRejection>,
) -> Result<Json<ResearchResponse>, AppError> {
    let Json(body) = body.map_err(|rejection| bad_request(rejection.body_text()))?;
    let options = ResearchOptions {
        top_k: body.top_k,
        model: body.model,
        api_key: None,
    };
    let report = research::deep_research(
        state.archive.as_ref(),
        &body.query,
        &options,
        &state.archive.config().research,
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "deep research failed");
        AppError::from(e)
    })?;

    Ok(Json(ResearchResponse {
        query: body.query,
        report,
    }))
}
