//! HTTP query endpoint.
//!
//! Serves ranked CI suggestions over a JSON HTTP API. The index snapshot is
//! loaded once before the listener binds and shared read-only by every
//! request; there is no hot reload.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/suggest_ci?q=<text>&k=<int>` | Ranked candidates, best first |
//! | `GET`  | `/health` | Health check (version and vector count) |
//!
//! # Error Contract
//!
//! All error responses share one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "q must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embedding_error` (500),
//! `dimension_mismatch` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, ServerConfig};
use crate::models::ScoredCandidate;
use crate::ranking::{SuggestError, Suggester};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    suggester: Suggester,
    default_k: i64,
    max_k: i64,
}

impl AppState {
    pub fn new(suggester: Suggester, server: &ServerConfig) -> Self {
        Self {
            suggester,
            default_k: server.default_k,
            max_k: server.max_k,
        }
    }
}

/// Build the router with all routes and the CORS layer.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/suggest_ci", get(handle_suggest))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Load the snapshot for `config`, then serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::new(Suggester::load(config)?, &config.server);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(stage = "api", "listening on http://{}", config.server.bind);
    println!("CI suggester listening on http://{}", config.server.bind);
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

/// Internal error type that converts into an Axum HTTP response.
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

impl From<SuggestError> for AppError {
    fn from(err: SuggestError) -> Self {
        let code = match &err {
            SuggestError::Embedding(_) => "embedding_error",
            SuggestError::DimensionMismatch { .. } => "dimension_mismatch",
        };
        tracing::error!(stage = "api", "suggest_ci failed: {}", err);
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    vectors: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vectors: state.suggester.snapshot().index.len(),
    })
}

// ============ GET /suggest_ci ============

/// Raw query parameters. `k` is parsed by hand so a malformed value gets the
/// JSON error body instead of the extractor's plain-text rejection.
#[derive(Deserialize)]
struct SuggestParams {
    q: Option<String>,
    k: Option<String>,
}

/// Resolve the requested `k`: default when absent, clamped to `max_k`.
fn resolve_k(raw: Option<&str>, default_k: i64, max_k: i64) -> Result<i64, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(default_k),
        Some(s) => s
            .parse::<i64>()
            .map(|k| k.min(max_k))
            .map_err(|_| bad_request(format!("k must be an integer, got '{}'", s))),
    }
}

async fn handle_suggest(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Vec<ScoredCandidate>>, AppError> {
    let q = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| bad_request("q must not be empty"))?;
    let k = resolve_k(params.k.as_deref(), state.default_k, state.max_k)?;

    let results = state.suggester.suggest(q, k).await?;
    Ok(Json(results))
}
