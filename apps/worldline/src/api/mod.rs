//! # Worldline HTTP API Module
//!
//! The Ingestion and Query interfaces over HTTP, using axum.
//!
//! ## Endpoints
//!
//! - `POST /events` - Ingest one event
//! - `POST /events/batch` - Ingest a batch of events
//! - `GET /worldlines/{id}` - Current state (with degraded flag)
//! - `GET /worldlines/{id}/history` - Every version, oldest first
//! - `GET /worldlines/{id}/neighbors?rel_type=` - Active outgoing edges
//! - `GET /find?class=&phase=&after=&limit=` - Worldlines by class and phase
//! - `GET /find/attribute?class=&attribute=&min=&max=` - Attribute range scan
//! - `GET /classes/{id}` - Class policy
//! - `GET /rejections` - Journaled structural rejections
//! - `GET /anomalies` - Journaled ordering anomalies
//! - `POST /sources/{id}/pause`, `POST /sources/{id}/resume` - Source gate
//! - `GET /sources/{id}/cursor` - Per-source cursor
//! - `GET /status` - Counts and counters
//! - `GET /hash` - BLAKE3 checksum of the canonical snapshot
//! - `POST /export` - Canonical snapshot, base64
//! - `GET /health` - Health check
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `WORLDLINE_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `WORLDLINE_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `WORLDLINE_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{API_KEY_ENV, get_api_key_from_env, keys_match};
pub use middleware::{
    DEFAULT_RATE_LIMIT, RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env,
    parse_rate_limit,
};
pub use types::{
    AttributeParams, BatchRequest, BatchResponse, CursorResponse, ErrorResponse, ExportResponse,
    FindParams, HashResponse, HealthResponse, IngestResponse, NeighborsParams, OutcomeKind,
    SourceResponse, StatusResponse, error_kind,
};

use crate::pipeline::Pipeline;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use worldline_core::RegistryError;

/// Environment variable holding allowed CORS origins.
pub const CORS_ORIGINS_ENV: &str = "WORLDLINE_CORS_ORIGINS";

/// Largest accepted request body (a full batch of events).
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state: the running shard workers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Storage backend name, reported by `/status`.
    pub backend: String,
}

impl AppState {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, backend: impl Into<String>) -> Self {
        Self {
            pipeline,
            backend: backend.into(),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `WORLDLINE_CORS_ORIGINS`.
///
/// - `*`: allows all origins (development only)
/// - unset: localhost only
/// - otherwise: comma-separated list of origins
fn build_cors_layer() -> CorsLayer {
    match std::env::var(CORS_ORIGINS_ENV).ok().as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins ({CORS_ORIGINS_ENV}=*)");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<HeaderValue>() {
                    Ok(hv) => Some(hv),
                    Err(e) => {
                        tracing::warn!("CORS: invalid origin '{}': {}", s, e);
                        None
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins in {CORS_ORIGINS_ENV}, using localhost");
                build_localhost_cors()
            } else {
                tracing::info!(origins = allowed.len(), "CORS: explicit origins");
                restricted_cors(allowed)
            }
        }
        None => build_localhost_cors(),
    }
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn build_localhost_cors() -> CorsLayer {
    let origins = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit, rate
/// limiting (if enabled), authentication (if configured).
pub fn create_router(state: AppState) -> Router {
    let rate_limit = get_rate_limit_from_env();
    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED: every endpoint is public. Set {API_KEY_ENV} to enable it."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/events", post(handlers::ingest_handler))
        .route("/events/batch", post(handlers::batch_handler))
        .route("/worldlines/{id}", get(handlers::current_handler))
        .route("/worldlines/{id}/history", get(handlers::history_handler))
        .route("/worldlines/{id}/neighbors", get(handlers::neighbors_handler))
        .route("/find", get(handlers::find_handler))
        .route("/find/attribute", get(handlers::attribute_handler))
        .route("/classes/{id}", get(handlers::class_handler))
        .route("/rejections", get(handlers::rejections_handler))
        .route("/anomalies", get(handlers::anomalies_handler))
        .route("/sources/{id}/pause", post(handlers::pause_handler))
        .route("/sources/{id}/resume", post(handlers::resume_handler))
        .route("/sources/{id}/cursor", get(handlers::cursor_handler))
        .route("/hash", get(handlers::hash_handler))
        .route("/export", post(handlers::export_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if rate_limit > 0 {
        tracing::info!("rate limiting enabled: {} requests/second", rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("rate limiting disabled");
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve the API until Ctrl+C, then stop the shard workers.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), RegistryError> {
    let pipeline = Arc::clone(&state.pipeline);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RegistryError::Io(format!("bind failed: {}", e)))?;

    tracing::info!("Worldline HTTP server listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RegistryError::Io(format!("server error: {}", e)));

    // Joining worker threads blocks; keep it off the async workers.
    tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .map_err(|e| RegistryError::Io(format!("shutdown failed: {}", e)))?;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
