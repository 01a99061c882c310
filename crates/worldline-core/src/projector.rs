//! # Entity Projector
//!
//! Applies one in-order event to a worldline's current state and produces
//! the records to persist, or a structural rejection.
//!
//! The projector is a pure function of its inputs: the view the shard reads
//! from the store, the event, the class policies and the blob resolution.
//! It never writes. The shard commits its output atomically.

use crate::blob::Resolution;
use crate::policy::{ClassPolicy, ClassPolicyStore};
use crate::{
    AnchorRef, BlobRef, ClassId, Entanglement, EventPayload, FieldMask, IngestedEvent, Phase,
    RelType, StateVersion, StructuralError, VerificationStatus, Worldline, WorldlineEntry,
    WorldlineHead, WorldlineId,
};
use serde::{Deserialize, Serialize};

/// What the projector needs to know about a worldline before an event.
#[derive(Debug, Clone, Default)]
pub struct View {
    pub entry: Option<WorldlineEntry>,
    /// The current (latest verified) version.
    pub base: Option<StateVersion>,
    /// The existing edge matching an `Entangle`/`Revoke`, if any.
    pub edge: Option<Entanglement>,
}

/// Summary of what an applied event changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created { phase: Phase },
    Versioned {
        sequence: u64,
        status: VerificationStatus,
    },
    Entangled,
    /// The edge was already active.
    AlreadyEntangled,
    Revoked,
    /// No active edge matched.
    NothingToRevoke,
}

/// Records to commit for an applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    /// Worldline metadata with its updated head.
    pub entry: WorldlineEntry,
    pub version: Option<StateVersion>,
    pub edge: Option<Entanglement>,
    pub change: Change,
}

/// Result of projecting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Applied(Effect),
    Rejected(StructuralError),
}

impl From<Result<Effect, StructuralError>> for Projection {
    fn from(result: Result<Effect, StructuralError>) -> Self {
        match result {
            Ok(effect) => Self::Applied(effect),
            Err(e) => Self::Rejected(e),
        }
    }
}

/// Project one event.
///
/// `resolve` is only called for `UpdateState` events that carry a blob, and
/// only after every structural check has passed.
pub fn project(
    view: &View,
    event: &IngestedEvent,
    policies: &dyn ClassPolicyStore,
    resolve: impl FnOnce(&BlobRef) -> Resolution,
) -> Projection {
    let result = match &event.payload {
        EventPayload::Create {
            class,
            anchor,
            origin,
            phase,
        } => create(view, event, policies, class, anchor, origin, phase.as_ref()),
        EventPayload::UpdateState { mask, blob, phase } => existing(view, event, policies)
            .and_then(|(entry, policy)| {
                update_state(
                    view,
                    event,
                    entry,
                    policy,
                    *mask,
                    blob.as_ref(),
                    phase.as_ref(),
                    resolve,
                )
            }),
        EventPayload::Entangle { rel_type, target } => existing(view, event, policies)
            .and_then(|(entry, policy)| {
                policy.check_rel_type(rel_type)?;
                entangle(view, event, entry, rel_type, target)
            }),
        EventPayload::Revoke { rel_type, target } => existing(view, event, policies)
            .map(|(entry, _)| revoke(view, event, entry, rel_type, target)),
    };
    result.into()
}

fn create(
    view: &View,
    event: &IngestedEvent,
    policies: &dyn ClassPolicyStore,
    class: &ClassId,
    anchor: &AnchorRef,
    origin: &str,
    requested: Option<&Phase>,
) -> Result<Effect, StructuralError> {
    if view.entry.is_some() {
        return Err(StructuralError::DuplicateCreate(event.worldline.clone()));
    }
    if event.sequence() != 0 {
        return Err(StructuralError::MalformedEvent(format!(
            "create must carry sequence 0, got {}",
            event.sequence()
        )));
    }
    if anchor.as_str().trim().is_empty() {
        return Err(StructuralError::MalformedAnchor(
            "anchor reference is empty".to_string(),
        ));
    }
    let policy = policies
        .get_class(class)
        .ok_or_else(|| StructuralError::UnknownClass(class.clone()))?;

    let derived = WorldlineId::derive(class, anchor, origin);
    if derived != event.worldline {
        return Err(StructuralError::WorldlineIdMismatch {
            declared: event.worldline.clone(),
            derived,
        });
    }

    let phase = policy.initial_phase(requested)?;
    let version = StateVersion {
        worldline: event.worldline.clone(),
        sequence: 0,
        applied_event: event.ordering.clone(),
        event_id: event.event_id.clone(),
        frequency: Default::default(),
        polarization: Default::default(),
        phase: phase.clone(),
        blob: None,
        observed_digest: None,
        status: VerificationStatus::Verified,
        timestamp: event.timestamp,
    };
    let entry = WorldlineEntry {
        worldline: Worldline {
            id: event.worldline.clone(),
            class: class.clone(),
            anchor: anchor.clone(),
            origin: origin.to_string(),
            created_at: event.timestamp,
        },
        head: WorldlineHead {
            last_applied: event.ordering.clone(),
            next_version: 1,
            current_version: 0,
            current_phase: phase.clone(),
        },
    };

    Ok(Effect {
        entry,
        version: Some(version),
        edge: None,
        change: Change::Created { phase },
    })
}

/// Entry and class policy of a worldline that must already exist.
fn existing<'a>(
    view: &'a View,
    event: &IngestedEvent,
    policies: &'a dyn ClassPolicyStore,
) -> Result<(&'a WorldlineEntry, &'a ClassPolicy), StructuralError> {
    let entry = view
        .entry
        .as_ref()
        .ok_or_else(|| StructuralError::UnknownWorldline(event.worldline.clone()))?;
    let policy = policies
        .get_class(&entry.worldline.class)
        .ok_or_else(|| StructuralError::UnknownClass(entry.worldline.class.clone()))?;
    Ok((entry, policy))
}

fn advanced(entry: &WorldlineEntry, event: &IngestedEvent) -> WorldlineEntry {
    let mut next = entry.clone();
    next.head.last_applied = event.ordering.clone();
    next
}

#[allow(clippy::too_many_arguments)]
fn update_state(
    view: &View,
    event: &IngestedEvent,
    entry: &WorldlineEntry,
    policy: &ClassPolicy,
    mask: FieldMask,
    blob: Option<&BlobRef>,
    phase: Option<&Phase>,
    resolve: impl FnOnce(&BlobRef) -> Resolution,
) -> Result<Effect, StructuralError> {
    if mask.is_empty() {
        return Err(StructuralError::MalformedEvent(
            "field mask selects nothing".to_string(),
        ));
    }
    if mask.phase != phase.is_some() {
        return Err(StructuralError::MalformedEvent(
            "phase must be given exactly when the mask selects it".to_string(),
        ));
    }
    if mask.needs_blob() != blob.is_some() {
        return Err(StructuralError::MalformedEvent(
            "blob must be given exactly when the mask selects frequency or polarization"
                .to_string(),
        ));
    }

    let base = view.base.as_ref().ok_or_else(|| {
        StructuralError::MalformedEvent(format!(
            "worldline {} has no current version",
            entry.worldline.id
        ))
    })?;

    // Transition legality is decided before any blob is fetched, so an
    // illegal update never touches the resolver.
    let next_phase = match phase {
        Some(to) => {
            policy.check_transition(&base.phase, to)?;
            to.clone()
        }
        None => base.phase.clone(),
    };

    let mut frequency = base.frequency.clone();
    let mut polarization = base.polarization.clone();
    let (status, observed_digest) = match blob {
        None => (VerificationStatus::Verified, None),
        Some(blob) => match resolve(blob) {
            Resolution::Verified { snapshot, digest } => {
                if mask.frequency {
                    frequency = snapshot.frequency;
                }
                if mask.polarization {
                    polarization = snapshot.polarization;
                }
                (VerificationStatus::Verified, Some(digest))
            }
            Resolution::Mismatch { observed } => {
                (VerificationStatus::IntegrityMismatch, Some(observed))
            }
            Resolution::Unresolved { reason } => {
                tracing::warn!(
                    worldline = %event.worldline,
                    event_id = %event.event_id,
                    reason = %reason,
                    "storing unresolved version"
                );
                (VerificationStatus::Unresolved, None)
            }
        },
    };

    let mut next = advanced(entry, event);
    let sequence = next.head.next_version;
    next.head.next_version = sequence.saturating_add(1);
    if status == VerificationStatus::Verified {
        next.head.current_version = sequence;
        next.head.current_phase = next_phase.clone();
    }

    let version = StateVersion {
        worldline: event.worldline.clone(),
        sequence,
        applied_event: event.ordering.clone(),
        event_id: event.event_id.clone(),
        frequency,
        polarization,
        phase: next_phase,
        blob: blob.cloned(),
        observed_digest,
        status,
        timestamp: event.timestamp,
    };

    Ok(Effect {
        entry: next,
        version: Some(version),
        edge: None,
        change: Change::Versioned { sequence, status },
    })
}

fn entangle(
    view: &View,
    event: &IngestedEvent,
    entry: &WorldlineEntry,
    rel_type: &RelType,
    target: &WorldlineId,
) -> Result<Effect, StructuralError> {
    if target.is_empty() {
        return Err(StructuralError::MalformedEvent(
            "entangle target is empty".to_string(),
        ));
    }
    let next = advanced(entry, event);

    match &view.edge {
        Some(edge) if edge.is_active() => Ok(Effect {
            entry: next,
            version: None,
            edge: None,
            change: Change::AlreadyEntangled,
        }),
        // A revoked edge comes back with a fresh creation time.
        _ => Ok(Effect {
            entry: next,
            version: None,
            edge: Some(Entanglement {
                source: event.worldline.clone(),
                target: target.clone(),
                rel_type: rel_type.clone(),
                created_at: event.timestamp,
                revoked_at: None,
            }),
            change: Change::Entangled,
        }),
    }
}

fn revoke(
    view: &View,
    event: &IngestedEvent,
    entry: &WorldlineEntry,
    rel_type: &RelType,
    target: &WorldlineId,
) -> Effect {
    let next = advanced(entry, event);
    match &view.edge {
        Some(edge) if edge.is_active() && edge.rel_type == *rel_type && edge.target == *target => {
            let mut revoked = edge.clone();
            revoked.revoked_at = Some(event.timestamp);
            Effect {
                entry: next,
                version: None,
                edge: Some(revoked),
                change: Change::Revoked,
            }
        }
        _ => Effect {
            entry: next,
            version: None,
            edge: None,
            change: Change::NothingToRevoke,
        },
    }
}

// =============================================================================
// TESTS
// =============================================================================
