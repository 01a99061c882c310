//! # Ingestor Module
//!
//! Event admission for the Worldline CORE.
//!
//! - Validate events before they reach a shard
//! - Reject malformed input
//! - Refuse events from paused sources
//! - No semantic inference or enrichment
//!
//! Checks here are cheap and stateless apart from the paused-source set.
//! Anything that needs the store (dedup, ordering, class policy) happens in
//! the owning shard.

use crate::primitives::{
    MAX_ANCHOR_LENGTH, MAX_BATCH_LENGTH, MAX_IDENTIFIER_LENGTH, MAX_ORIGIN_LENGTH,
};
use crate::{EventPayload, IngestedEvent, RegistryError, SourceId, StructuralError};
use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// The Ingestor handles event validation and source gating.
///
/// Shared by every producer; all methods take `&self`.
#[derive(Debug, Default)]
pub struct Ingestor {
    paused: RwLock<BTreeSet<SourceId>>,
}

impl Ingestor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate an event.
    ///
    /// An event is valid if:
    /// - Event id, worldline id and source are non-empty and within limits
    /// - Every identifier in the payload is within limits
    /// - A `Create` carries a non-empty class and anchor
    ///
    /// Returns `StructuralError::MalformedEvent` or `MalformedAnchor`.
    pub fn validate(event: &IngestedEvent) -> Result<(), RegistryError> {
        check_identifier("event_id", event.event_id.as_str())?;
        check_identifier("worldline", event.worldline.as_str())?;
        check_identifier("source", event.ordering.source.as_str())?;

        match &event.payload {
            EventPayload::Create {
                class,
                anchor,
                origin,
                phase,
            } => {
                check_identifier("class", class.as_str())?;
                if anchor.as_str().trim().is_empty() {
                    return Err(StructuralError::MalformedAnchor(
                        "anchor reference is empty".to_string(),
                    )
                    .into());
                }
                if anchor.as_str().len() > MAX_ANCHOR_LENGTH {
                    return Err(StructuralError::MalformedAnchor(format!(
                        "anchor reference exceeds {MAX_ANCHOR_LENGTH} bytes"
                    ))
                    .into());
                }
                if origin.len() > MAX_ORIGIN_LENGTH {
                    return Err(malformed(format!("origin exceeds {MAX_ORIGIN_LENGTH} bytes")));
                }
                if let Some(phase) = phase {
                    check_identifier("phase", phase.as_str())?;
                }
            }
            EventPayload::UpdateState { blob, phase, .. } => {
                if let Some(phase) = phase {
                    check_identifier("phase", phase.as_str())?;
                }
                if let Some(blob) = blob {
                    check_identifier("blob reference", &blob.reference)?;
                }
            }
            EventPayload::Entangle { rel_type, target }
            | EventPayload::Revoke { rel_type, target } => {
                check_identifier("rel_type", rel_type.as_str())?;
                check_identifier("target", target.as_str())?;
            }
        }
        Ok(())
    }

    /// Validate a batch: bounded length, every event valid.
    pub fn validate_batch(events: &[IngestedEvent]) -> Result<(), RegistryError> {
        if events.len() > MAX_BATCH_LENGTH {
            return Err(malformed(format!(
                "batch of {} events exceeds {MAX_BATCH_LENGTH}",
                events.len()
            )));
        }
        events.iter().try_for_each(Self::validate)
    }

    /// Validate an event and check that its source is not paused.
    pub fn admit(&self, event: &IngestedEvent) -> Result<(), RegistryError> {
        Self::validate(event)?;
        if self.is_paused(&event.ordering.source) {
            return Err(RegistryError::SourcePaused(event.ordering.source.clone()));
        }
        Ok(())
    }

    /// Stop admitting events from `source`. Returns false if already paused.
    pub fn pause(&self, source: SourceId) -> bool {
        let inserted = self
            .paused
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.clone());
        if inserted {
            tracing::info!(source = %source, "source paused");
        }
        inserted
    }

    /// Admit events from `source` again. Returns false if it was not paused.
    pub fn resume(&self, source: &SourceId) -> bool {
        let removed = self
            .paused
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source);
        if removed {
            tracing::info!(source = %source, "source resumed");
        }
        removed
    }

    #[must_use]
    pub fn is_paused(&self, source: &SourceId) -> bool {
        self.paused
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(source)
    }

    /// Paused sources, sorted.
    #[must_use]
    pub fn paused_sources(&self) -> Vec<SourceId> {
        self.paused
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

fn malformed(reason: String) -> RegistryError {
    StructuralError::MalformedEvent(reason).into()
}

fn check_identifier(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.is_empty() {
        return Err(malformed(format!("{field} is empty")));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(malformed(format!(
            "{field} exceeds {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{EventId, FieldMask, OrderingKey, WorldlineId};

    fn create(anchor: &str) -> IngestedEvent {
        IngestedEvent::create("e-1", "ledger", 1, "GOLD_VAULT", anchor, "0,0")
    }

    #[test]
    fn validate_accepts_valid_create() {
        assert!(Ingestor::validate(&create("SKR-001")).is_ok());
    }

    #[test]
    fn validate_rejects_blank_anchor() {
        let err = Ingestor::validate(&create("  ")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Structural(StructuralError::MalformedAnchor(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_event_id() {
        let mut event = create("SKR-001");
        event.event_id = EventId::new("");
        assert!(Ingestor::validate(&event).is_err());
    }

    #[test]
    fn validate_rejects_oversized_identifier() {
        let event = IngestedEvent {
            event_id: "e-2".into(),
            worldline: WorldlineId::new("w".repeat(MAX_IDENTIFIER_LENGTH + 1)),
            ordering: OrderingKey::new("ledger", 1),
            timestamp: 2,
            payload: EventPayload::UpdateState {
                mask: FieldMask::phase_only(),
                blob: None,
                phase: Some("ONCHAIN_ACTIVE".into()),
            },
        };
        assert!(Ingestor::validate(&event).is_err());
    }

    #[test]
    fn validate_batch_checks_every_event() {
        let mut bad = create("SKR-002");
        bad.ordering.source = SourceId::new("");
        assert!(Ingestor::validate_batch(&[create("SKR-001")]).is_ok());
        assert!(Ingestor::validate_batch(&[create("SKR-001"), bad]).is_err());
    }

    #[test]
    fn paused_source_is_refused_until_resumed() {
        let ingestor = Ingestor::new();
        let event = create("SKR-001");
        assert!(ingestor.pause(SourceId::from("ledger")));
        assert!(!ingestor.pause(SourceId::from("ledger")));
        assert!(matches!(
            ingestor.admit(&event),
            Err(RegistryError::SourcePaused(_))
        ));
        assert_eq!(ingestor.paused_sources(), vec![SourceId::from("ledger")]);

        assert!(ingestor.resume(&SourceId::from("ledger")));
        assert!(ingestor.admit(&event).is_ok());
    }
}
