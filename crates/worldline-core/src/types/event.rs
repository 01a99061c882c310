//! # Ingested Events
//!
//! The unit of work for the registry. An event is scoped to exactly one
//! worldline and carries the ordering key that places it in that
//! worldline's history.

use super::ids::{AnchorRef, ClassId, Digest, EventId, Phase, RelType, SourceId, WorldlineId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// =============================================================================
// ORDERING KEY
// =============================================================================

/// Position of an event in its worldline's history.
///
/// `sequence` is strictly increasing per worldline; `source` records which
/// emitter produced it and is used for per-source cursors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderingKey {
    pub source: SourceId,
    pub sequence: u64,
}

impl OrderingKey {
    #[must_use]
    pub fn new(source: impl Into<SourceId>, sequence: u64) -> Self {
        Self {
            source: source.into(),
            sequence,
        }
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// FIELD MASK & BLOB REFERENCE
// =============================================================================

/// Which state fields an `UpdateState` event changes.
///
/// Fields outside the mask carry forward unchanged from the prior version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FieldMask {
    #[serde(default)]
    pub frequency: bool,
    #[serde(default)]
    pub polarization: bool,
    #[serde(default)]
    pub phase: bool,
}

impl FieldMask {
    /// Mask that only changes the phase.
    #[must_use]
    pub const fn phase_only() -> Self {
        Self {
            frequency: false,
            polarization: false,
            phase: true,
        }
    }

    /// Mask that changes both blob-backed fields.
    #[must_use]
    pub const fn payload() -> Self {
        Self {
            frequency: true,
            polarization: true,
            phase: false,
        }
    }

    /// True if any blob-backed field is selected.
    #[must_use]
    pub const fn needs_blob(&self) -> bool {
        self.frequency || self.polarization
    }

    /// True if nothing is selected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.frequency && !self.polarization && !self.phase
    }
}

/// Reference to a content-addressed payload plus the digest the emitter
/// declared for it.
///
/// The expected digest travels with the event so tampering is detectable
/// independently of the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub reference: String,
    pub expected_digest: Digest,
}

impl BlobRef {
    #[must_use]
    pub fn new(reference: impl Into<String>, expected_digest: Digest) -> Self {
        Self {
            reference: reference.into(),
            expected_digest,
        }
    }
}

// =============================================================================
// EVENT PAYLOAD
// =============================================================================

/// What an event asks the projector to do.
///
/// Externally tagged so the same shape works for JSON and postcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// Start a worldline. `phase` defaults to the class's initial state.
    Create {
        class: ClassId,
        anchor: AnchorRef,
        origin: String,
        #[serde(default)]
        phase: Option<Phase>,
    },
    /// Produce a new state version.
    UpdateState {
        mask: FieldMask,
        #[serde(default)]
        blob: Option<BlobRef>,
        #[serde(default)]
        phase: Option<Phase>,
    },
    /// Add a directed, typed edge from this worldline to `target`.
    Entangle {
        rel_type: RelType,
        target: WorldlineId,
    },
    /// Mark the matching edge as revoked.
    Revoke {
        rel_type: RelType,
        target: WorldlineId,
    },
}

impl EventPayload {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::UpdateState { .. } => "update_state",
            Self::Entangle { .. } => "entangle",
            Self::Revoke { .. } => "revoke",
        }
    }
}

/// An identity-scoped event as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedEvent {
    pub event_id: EventId,
    pub worldline: WorldlineId,
    pub ordering: OrderingKey,
    /// Source-assigned timestamp (milliseconds). Never read from a clock,
    /// so replay reproduces it exactly.
    pub timestamp: u64,
    pub payload: EventPayload,
}

impl IngestedEvent {
    /// Sequence number within the worldline.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.ordering.sequence
    }

    /// Build a `Create` event whose worldline id is derived from its fields.
    #[must_use]
    pub fn create(
        event_id: impl Into<EventId>,
        source: impl Into<SourceId>,
        timestamp: u64,
        class: impl Into<ClassId>,
        anchor: impl Into<AnchorRef>,
        origin: impl Into<String>,
    ) -> Self {
        let class = class.into();
        let anchor = anchor.into();
        let origin = origin.into();
        Self {
            event_id: event_id.into(),
            worldline: WorldlineId::derive(&class, &anchor, &origin),
            ordering: OrderingKey::new(source, 0),
            timestamp,
            payload: EventPayload::Create {
                class,
                anchor,
                origin,
                phase: None,
            },
        }
    }
}
