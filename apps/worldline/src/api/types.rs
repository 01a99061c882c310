//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.
//!
//! Events, versions and edges are served in their core serde shape; the
//! types here wrap them with the `success`/`error` envelope every endpoint
//! uses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldline_core::primitives::{DEFAULT_SCAN_PAGE, MAX_SCAN_PAGE};
use worldline_core::{
    Admission, ApplyReport, ApplyResult, EventId, IngestOutcome, IngestedEvent, RegistryError,
    RegistryStats, SourceId, WorldlineId,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// ERROR RESPONSE
// =============================================================================

/// Body of every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// Short machine-readable category (`structural`, `not_found`, ...).
    pub kind: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            kind: kind.into(),
            error: msg.into(),
        }
    }

    #[must_use]
    pub fn from_error(error: &RegistryError) -> Self {
        Self::new(error_kind(error), error.to_string())
    }
}

/// Category name of a registry error.
#[must_use]
pub fn error_kind(error: &RegistryError) -> &'static str {
    match error {
        RegistryError::Structural(_) => "structural",
        RegistryError::Transient(_) => "transient",
        RegistryError::Ordering(_) => "ordering",
        RegistryError::NotFound(_) => "not_found",
        RegistryError::SourcePaused(_) => "source_paused",
        RegistryError::AlreadyBuffered(_) => "already_buffered",
        RegistryError::BufferFull { .. } => "buffer_full",
        RegistryError::Serialization(_) => "serialization",
        RegistryError::Io(_) => "io",
        RegistryError::Config(_) => "invalid",
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Registry status: counts, counters and paused sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub backend: String,
    pub paused_sources: Vec<SourceId>,
    #[serde(flatten)]
    pub stats: RegistryStats,
}

// =============================================================================
// INGEST REQUEST/RESPONSE
// =============================================================================

/// What happened to a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Applied, possibly releasing buffered successors.
    Applied,
    /// Held for a missing earlier sequence.
    Buffered,
    /// Refused at the gate or rejected by the projector.
    Rejected,
    /// Already processed. Nothing changed.
    Deduplicated,
}

/// Answer to one ingested event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub event_id: EventId,
    pub outcome: OutcomeKind,
    /// Sequence the worldline is waiting for, when buffered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<u64>,
    /// Every event applied as a consequence, in apply order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<ApplyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub error: Option<String>,
}

impl IngestResponse {
    /// Translate a pipeline outcome for `event_id`.
    ///
    /// An accepted event whose own report is a structural rejection is
    /// reported as rejected; released successors keep their own results in
    /// `reports`.
    #[must_use]
    pub fn from_outcome(event_id: EventId, outcome: IngestOutcome) -> Self {
        let base = Self {
            success: true,
            event_id,
            outcome: OutcomeKind::Applied,
            awaiting: None,
            reports: Vec::new(),
            kind: None,
            error: None,
        };
        match outcome {
            IngestOutcome::Accepted(Admission::Applied(reports)) => {
                let rejection = reports
                    .iter()
                    .find(|r| r.event_id == base.event_id)
                    .and_then(|r| match &r.result {
                        ApplyResult::Rejected(e) => Some(e.to_string()),
                        ApplyResult::Applied(_) => None,
                    });
                match rejection {
                    Some(reason) => Self {
                        success: false,
                        outcome: OutcomeKind::Rejected,
                        kind: Some("structural".to_string()),
                        error: Some(reason),
                        reports,
                        ..base
                    },
                    None => Self { reports, ..base },
                }
            }
            IngestOutcome::Accepted(Admission::Buffered { awaiting }) => Self {
                outcome: OutcomeKind::Buffered,
                awaiting: Some(awaiting),
                ..base
            },
            IngestOutcome::Deduplicated => Self {
                outcome: OutcomeKind::Deduplicated,
                ..base
            },
            IngestOutcome::Rejected(e) => Self {
                success: false,
                outcome: OutcomeKind::Rejected,
                kind: Some(error_kind(&e).to_string()),
                error: Some(e.to_string()),
                ..base
            },
        }
    }
}

/// Batch ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<IngestedEvent>,
}

/// Batch ingest response: one entry per event, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success: bool,
    pub results: Vec<IngestResponse>,
}

// =============================================================================
// QUERY PARAMETERS
// =============================================================================

/// `GET /worldlines/{id}/neighbors`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborsParams {
    #[serde(default)]
    pub rel_type: Option<String>,
}

/// `GET /find`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindParams {
    pub class: String,
    pub phase: String,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindParams {
    /// Requested page size, clamped to `1..=MAX_SCAN_PAGE`.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_SCAN_PAGE).clamp(1, MAX_SCAN_PAGE)
    }
}

/// `GET /find/attribute`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeParams {
    pub class: String,
    pub attribute: String,
    #[serde(default = "i64_min")]
    pub min: i64,
    #[serde(default = "i64_max")]
    pub max: i64,
}

fn i64_min() -> i64 {
    i64::MIN
}

fn i64_max() -> i64 {
    i64::MAX
}

// =============================================================================
// SOURCE RESPONSES
// =============================================================================

/// Answer to pause/resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResponse {
    pub success: bool,
    pub source: SourceId,
    pub paused: bool,
    /// False when the source already was in the requested state.
    pub changed: bool,
}

/// Last processed sequence per worldline for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorResponse {
    pub source: SourceId,
    pub paused: bool,
    pub cursor: BTreeMap<WorldlineId, u64>,
}

// =============================================================================
// HASH / EXPORT RESPONSES
// =============================================================================

/// Canonical checksum of the projected state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashResponse {
    pub checksum: String,
    pub worldlines: u64,
    pub versions: u64,
    pub edges: u64,
}

/// Export response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub success: bool,
    pub data: Option<String>, // Base64 encoded
    pub checksum: Option<String>,
    pub error: Option<String>,
}

impl ExportResponse {
    pub fn success(data: &[u8], checksum: String) -> Self {
        Self {
            success: true,
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                data,
            )),
            checksum: Some(checksum),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            checksum: None,
            error: Some(msg.into()),
        }
    }
}
