//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.
//!
//! Ingestion goes through the shard workers; every read goes straight to
//! the shared query service and is side-effect-free.

use super::{
    AppState,
    types::{
        AttributeParams, BatchRequest, BatchResponse, CursorResponse, ErrorResponse,
        ExportResponse, FindParams, HashResponse, HealthResponse, IngestResponse,
        NeighborsParams, OutcomeKind, SourceResponse, StatusResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use worldline_core::{
    CanonicalSnapshot, ClassId, EventId, IngestOutcome, IngestedEvent, Phase, RegistryError,
    RelType, SourceId, WorldlineId,
};

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// HTTP status for a registry error.
fn status_for(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::Structural(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Ordering(_)
        | RegistryError::SourcePaused(_)
        | RegistryError::AlreadyBuffered(_) => StatusCode::CONFLICT,
        RegistryError::Transient(_) | RegistryError::BufferFull { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RegistryError::Serialization(_) | RegistryError::Config(_) => StatusCode::BAD_REQUEST,
        RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &RegistryError) -> Response {
    (status_for(error), Json(ErrorResponse::from_error(error))).into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, RegistryError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Counts, counters and paused sources.
pub async fn status_handler(State(state): State<AppState>) -> Response {
    respond(
        state
            .pipeline
            .query()
            .stats()
            .map(|stats| StatusResponse {
                backend: state.backend.clone(),
                paused_sources: state.pipeline.paused_sources(),
                stats,
            }),
    )
}

// =============================================================================
// INGEST HANDLERS
// =============================================================================

fn ingest_response(event_id: EventId, outcome: IngestOutcome) -> (StatusCode, IngestResponse) {
    let refused = match &outcome {
        IngestOutcome::Rejected(e) => Some(status_for(e)),
        _ => None,
    };
    let response = IngestResponse::from_outcome(event_id, outcome);
    let status = refused.unwrap_or(match response.outcome {
        OutcomeKind::Applied | OutcomeKind::Deduplicated => StatusCode::OK,
        OutcomeKind::Buffered => StatusCode::ACCEPTED,
        OutcomeKind::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
    });
    (status, response)
}

/// Ingest one event.
pub async fn ingest_handler(
    State(state): State<AppState>,
    Json(event): Json<IngestedEvent>,
) -> Response {
    let event_id = event.event_id.clone();
    let outcome = state.pipeline.ingest(event).await;
    let (status, response) = ingest_response(event_id, outcome);
    (status, Json(response)).into_response()
}

/// Ingest a batch. Not atomic: every event gets its own result.
pub async fn batch_handler(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Response {
    let ids: Vec<EventId> = request.events.iter().map(|e| e.event_id.clone()).collect();
    let outcomes = match state.pipeline.ingest_batch(request.events).await {
        Ok(outcomes) => outcomes,
        Err(e) => return error_response(&e),
    };

    let results: Vec<IngestResponse> = ids
        .into_iter()
        .zip(outcomes)
        .map(|(id, outcome)| ingest_response(id, outcome).1)
        .collect();
    let success = results.iter().all(|r| r.success);
    (StatusCode::OK, Json(BatchResponse { success, results })).into_response()
}

// =============================================================================
// WORLDLINE HANDLERS
// =============================================================================

/// Current state of a worldline.
pub async fn current_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.pipeline.query().get_current(&WorldlineId::from(id)))
}

/// Every version of a worldline, oldest first.
pub async fn history_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.pipeline.query().get_history(&WorldlineId::from(id)))
}

/// Active outgoing edges.
pub async fn neighbors_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<NeighborsParams>,
) -> Response {
    let rel_type = params.rel_type.map(RelType::from);
    respond(
        state
            .pipeline
            .query()
            .get_neighbors(&WorldlineId::from(id), rel_type.as_ref()),
    )
}

// =============================================================================
// INDEX HANDLERS
// =============================================================================

/// One page of worldlines by class and current phase.
pub async fn find_handler(
    State(state): State<AppState>,
    Query(params): Query<FindParams>,
) -> Response {
    let limit = params.page_size();
    let after = params.after.map(WorldlineId::from);
    respond(state.pipeline.query().find_by_class_and_phase(
        &ClassId::from(params.class),
        &Phase::from(params.phase),
        after.as_ref(),
        limit,
    ))
}

/// Worldlines whose current version holds an attribute inside a range.
pub async fn attribute_handler(
    State(state): State<AppState>,
    Query(params): Query<AttributeParams>,
) -> Response {
    if params.min > params.max {
        return error_response(&RegistryError::Config(format!(
            "min {} exceeds max {}",
            params.min, params.max
        )));
    }
    respond(state.pipeline.query().find_by_attribute_range(
        &ClassId::from(params.class),
        &params.attribute,
        params.min,
        params.max,
    ))
}

/// Policy of a class.
pub async fn class_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pipeline.query().get_class(&ClassId::from(id.as_str())) {
        Some(policy) => (StatusCode::OK, Json(policy)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                format!("unknown class: {id}"),
            )),
        )
            .into_response(),
    }
}

// =============================================================================
// OPERATOR HANDLERS
// =============================================================================

/// Journaled structural rejections.
pub async fn rejections_handler(State(state): State<AppState>) -> Response {
    respond(state.pipeline.query().rejections())
}

/// Journaled ordering anomalies.
pub async fn anomalies_handler(State(state): State<AppState>) -> Response {
    respond(state.pipeline.query().anomalies())
}

/// Stop admitting events from a source.
pub async fn pause_handler(State(state): State<AppState>, Path(source): Path<String>) -> Response {
    let source = SourceId::from(source);
    let changed = state.pipeline.pause(source.clone());
    tracing::info!(source = %source, changed, "source paused");
    Json(SourceResponse {
        success: true,
        source,
        paused: true,
        changed,
    })
    .into_response()
}

/// Admit a paused source again.
pub async fn resume_handler(State(state): State<AppState>, Path(source): Path<String>) -> Response {
    let source = SourceId::from(source);
    let changed = state.pipeline.resume(&source);
    tracing::info!(source = %source, changed, "source resumed");
    Json(SourceResponse {
        success: true,
        source,
        paused: false,
        changed,
    })
    .into_response()
}

/// Last processed sequence per worldline for a source.
pub async fn cursor_handler(State(state): State<AppState>, Path(source): Path<String>) -> Response {
    let source = SourceId::from(source);
    let paused = state.pipeline.paused_sources().contains(&source);
    respond(
        state
            .pipeline
            .query()
            .cursor(&source)
            .map(|cursor| CursorResponse {
                source,
                paused,
                cursor,
            }),
    )
}

// =============================================================================
// HASH / EXPORT HANDLERS
// =============================================================================

/// BLAKE3 checksum of the canonical snapshot.
pub async fn hash_handler(State(state): State<AppState>) -> Response {
    respond(
        CanonicalSnapshot::capture(state.pipeline.query()).and_then(|snapshot| {
            Ok(HashResponse {
                checksum: snapshot.checksum()?.to_hex(),
                worldlines: snapshot.entries.len() as u64,
                versions: snapshot.versions.len() as u64,
                edges: snapshot.edges.len() as u64,
            })
        }),
    )
}

/// Canonical snapshot, base64 encoded.
pub async fn export_handler(State(state): State<AppState>) -> Response {
    let exported = CanonicalSnapshot::capture(state.pipeline.query())
        .and_then(|snapshot| Ok((snapshot.export()?, snapshot.checksum()?)));
    match exported {
        Ok((data, checksum)) => (
            StatusCode::OK,
            Json(ExportResponse::success(&data, checksum.to_hex())),
        )
            .into_response(),
        Err(e) => (
            status_for(&e),
            Json(ExportResponse::error(e.to_string())),
        )
            .into_response(),
    }
}
