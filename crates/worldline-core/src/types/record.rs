//! # Stored Records
//!
//! What the projector produces and the store keeps: worldline metadata,
//! immutable state versions and entanglement edges.

use super::error::{OrderingAnomaly, StructuralError};
use super::event::{BlobRef, OrderingKey};
use super::ids::{AnchorRef, ClassId, Digest, EventId, Phase, RelType, WorldlineId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// WORLDLINE
// =============================================================================

/// One tracked instance of an entity class.
///
/// Every field is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worldline {
    pub id: WorldlineId,
    pub class: ClassId,
    pub anchor: AnchorRef,
    pub origin: String,
    pub created_at: u64,
}

/// Mutable bookkeeping the store keeps next to a worldline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldlineHead {
    /// Ordering key of the last event processed for this worldline
    /// (applied or structurally rejected).
    pub last_applied: OrderingKey,
    /// Sequence number the next state version will receive.
    pub next_version: u64,
    /// Sequence of the current (latest verified) version.
    pub current_version: u64,
    /// Phase of the current version; drives the class/phase index.
    pub current_phase: Phase,
}

impl WorldlineHead {
    /// True if versions newer than the current one exist but none of them
    /// verified.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.next_version > self.current_version.saturating_add(1)
    }
}

/// Metadata plus head, as stored per worldline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldlineEntry {
    pub worldline: Worldline,
    pub head: WorldlineHead,
}

// =============================================================================
// STATE VERSION
// =============================================================================

/// Outcome of resolving and checking a version's blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VerificationStatus {
    /// Blob resolved and matched its declared digest (or no blob needed).
    Verified,
    /// Blob resolved but hashed to a different digest than declared.
    IntegrityMismatch,
    /// Blob could not be fetched or decoded within the retry budget.
    Unresolved,
}

impl VerificationStatus {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::Unresolved => "unresolved",
        }
    }
}

/// Numeric attributes of a version. Integers only.
pub type Frequency = BTreeMap<String, i64>;

/// Tag set of a version.
pub type Polarization = BTreeSet<String>;

/// An immutable snapshot in a worldline's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub worldline: WorldlineId,
    /// Monotonic, gapless per worldline, starting at 0 for the Create.
    pub sequence: u64,
    pub applied_event: OrderingKey,
    pub event_id: EventId,
    pub frequency: Frequency,
    pub polarization: Polarization,
    pub phase: Phase,
    /// The blob this version was built from, if any.
    pub blob: Option<BlobRef>,
    /// Digest actually computed from the fetched bytes, if they were fetched.
    pub observed_digest: Option<Digest>,
    pub status: VerificationStatus,
    pub timestamp: u64,
}

impl StateVersion {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

// =============================================================================
// ENTANGLEMENT
// =============================================================================

/// A directed, typed edge between two worldlines.
///
/// Edges hold ids only; targets are resolved by lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entanglement {
    pub source: WorldlineId,
    pub target: WorldlineId,
    pub rel_type: RelType,
    pub created_at: u64,
    pub revoked_at: Option<u64>,
}

impl Entanglement {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

// =============================================================================
// QUERY VIEWS
// =============================================================================

/// Result of a current-state lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub worldline: Worldline,
    pub version: StateVersion,
    /// Later versions exist that failed verification or resolution.
    pub degraded: bool,
}

// =============================================================================
// JOURNAL RECORDS
// =============================================================================

/// A structurally rejected event, kept for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub event_id: EventId,
    pub worldline: WorldlineId,
    pub ordering: OrderingKey,
    /// Payload kind (`create`, `update_state`, ...).
    pub kind: String,
    pub error: StructuralError,
    pub timestamp: u64,
}

/// An ordering anomaly worth an operator's attention.
///
/// `observed_at` is the pipeline tick that noticed it, not an event time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly: OrderingAnomaly,
    pub observed_at: u64,
}
