//! # Core Type Definitions
//!
//! This module contains all core types for the Worldline registry:
//! - Identifiers (`WorldlineId`, `ClassId`, `Phase`, `RelType`, `EventId`, ...)
//! - Ingested events (`IngestedEvent`, `EventPayload`, `OrderingKey`)
//! - Stored records (`Worldline`, `StateVersion`, `Entanglement`)
//! - Error types (`RegistryError` and its three families)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` where they key `BTreeMap`/`BTreeSet`
//! - Carry source-assigned timestamps, never wall-clock reads

mod error;
mod event;
mod ids;
mod record;

pub use error::{OrderingAnomaly, RegistryError, StructuralError, TransientError};
pub use event::{BlobRef, EventPayload, FieldMask, IngestedEvent, OrderingKey};
pub use ids::{AnchorRef, ClassId, Digest, EventId, Phase, RelType, SourceId, WorldlineId};
pub use record::{
    Anomaly, CurrentState, Entanglement, Frequency, Polarization, Rejection, StateVersion,
    VerificationStatus, Worldline, WorldlineEntry, WorldlineHead,
};
